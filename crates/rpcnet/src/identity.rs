//! Object identities

use std::fmt;
use std::str::FromStr;

use crate::error::LocalError;

/// Identity of a remote object: a name within an optional category
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    pub fn with_category(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

fn escape(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '/' | '\\' | ' ' | ':' | '@' | '"' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
}

fn unescape(s: &str) -> Result<String, LocalError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => {
                    return Err(LocalError::IllegalIdentity(format!(
                        "trailing escape in `{}'",
                        s
                    )))
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        if !self.category.is_empty() {
            escape(&self.category, &mut s);
            s.push('/');
        }
        escape(&self.name, &mut s);
        f.write_str(&s)
    }
}

impl FromStr for Identity {
    type Err = LocalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Find the first unescaped slash
        let mut split = None;
        let mut escaped = false;
        for (i, c) in s.char_indices() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '/' {
                if split.is_some() {
                    return Err(LocalError::IllegalIdentity(format!(
                        "unescaped slash in `{}'",
                        s
                    )));
                }
                split = Some(i);
            }
        }

        match split {
            None => Ok(Identity::new(unescape(s)?)),
            Some(i) => Ok(Identity::with_category(
                unescape(&s[i + 1..])?,
                unescape(&s[..i])?,
            )),
        }
    }
}
