//! Object references (proxies)
//!
//! A proxy names an object by identity and facet and says how to reach it:
//! either a list of concrete endpoints (direct) or an adapter id that a
//! locator resolves (indirect). An indirect proxy with an empty adapter id is
//! "well-known": only its identity is known.
//!
//! String form: `identity [-f facet] -t|-o|-O|-d|-D [-s] [:endpoint...|@ adapter]`.

use std::fmt;

use rpcnet::endpoint::{split_args, split_endpoint_list};
use rpcnet::{Endpoint, EndpointFactoryManager, Identity, LocalError, Result};
use tracing::warn;

/// How invocations on a proxy are sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    #[default]
    Twoway,
    Oneway,
    BatchOneway,
    Datagram,
    BatchDatagram,
}

impl InvocationMode {
    fn option(self) -> &'static str {
        match self {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        }
    }

    fn from_option(option: &str) -> Option<Self> {
        Some(match option {
            "-t" => InvocationMode::Twoway,
            "-o" => InvocationMode::Oneway,
            "-O" => InvocationMode::BatchOneway,
            "-d" => InvocationMode::Datagram,
            "-D" => InvocationMode::BatchDatagram,
            _ => return None,
        })
    }

    pub fn is_twoway(self) -> bool {
        self == InvocationMode::Twoway
    }

    pub fn is_batch(self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }
}

/// Options an adapter stamps on the proxies it creates (`<name>.ProxyOptions`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProxyOptions {
    pub mode: InvocationMode,
    pub secure: bool,
}

impl ProxyOptions {
    pub fn parse(options: &str) -> Result<Self> {
        let args = split_args(options).map_err(|_| {
            LocalError::ProxyParse(format!("mismatched quotes in proxy options `{}'", options))
        })?;
        let mut parsed = ProxyOptions::default();
        for arg in &args {
            if arg == "-s" {
                parsed.secure = true;
            } else if let Some(mode) = InvocationMode::from_option(arg) {
                parsed.mode = mode;
            } else {
                return Err(LocalError::ProxyParse(format!(
                    "unknown option `{}' in `{}'",
                    arg, options
                )));
            }
        }
        Ok(parsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Direct(Vec<Endpoint>),
    /// Adapter id or replica group id; empty for well-known proxies
    Indirect(String),
}

/// Reference to a possibly remote object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    identity: Identity,
    facet: String,
    options: ProxyOptions,
    target: Target,
    router: Option<Identity>,
}

impl Proxy {
    pub fn direct(identity: Identity, endpoints: Vec<Endpoint>) -> Self {
        Self {
            identity,
            facet: String::new(),
            options: ProxyOptions::default(),
            target: Target::Direct(endpoints),
            router: None,
        }
    }

    pub fn indirect(identity: Identity, adapter_id: impl Into<String>) -> Self {
        Self {
            identity,
            facet: String::new(),
            options: ProxyOptions::default(),
            target: Target::Indirect(adapter_id.into()),
            router: None,
        }
    }

    pub fn well_known(identity: Identity) -> Self {
        Self::indirect(identity, String::new())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn facet(&self) -> &str {
        &self.facet
    }

    pub fn mode(&self) -> InvocationMode {
        self.options.mode
    }

    pub fn is_secure(&self) -> bool {
        self.options.secure
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Endpoints of a direct proxy, empty for indirect ones
    pub fn endpoints(&self) -> &[Endpoint] {
        match &self.target {
            Target::Direct(endpoints) => endpoints,
            Target::Indirect(_) => &[],
        }
    }

    /// Adapter id of an indirect proxy, empty for direct ones
    pub fn adapter_id(&self) -> &str {
        match &self.target {
            Target::Direct(_) => "",
            Target::Indirect(id) => id,
        }
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self.target, Target::Indirect(_))
    }

    /// Neither endpoints nor an adapter id: resolved by identity alone
    pub fn is_well_known(&self) -> bool {
        match &self.target {
            Target::Direct(endpoints) => endpoints.is_empty(),
            Target::Indirect(id) => id.is_empty(),
        }
    }

    pub fn router(&self) -> Option<&Identity> {
        self.router.as_ref()
    }

    pub fn with_facet(&self, facet: impl Into<String>) -> Self {
        Self {
            facet: facet.into(),
            ..self.clone()
        }
    }

    pub fn with_mode(&self, mode: InvocationMode) -> Self {
        let mut proxy = self.clone();
        proxy.options.mode = mode;
        proxy
    }

    pub fn with_options(&self, options: ProxyOptions) -> Self {
        Self {
            options,
            ..self.clone()
        }
    }

    pub fn with_router(&self, router: Option<Identity>) -> Self {
        Self {
            router,
            ..self.clone()
        }
    }

    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        Self {
            target: Target::Direct(endpoints),
            ..self.clone()
        }
    }

    /// Parse the string form of a proxy
    pub fn parse(s: &str, endpoints: &EndpointFactoryManager) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocalError::ProxyParse("empty proxy string".into()));
        }

        let (head, tail) = match find_target_separator(s) {
            Some(i) => (&s[..i], Some((s.as_bytes()[i], &s[i + 1..]))),
            None => (s, None),
        };

        let args = split_args(head)
            .map_err(|_| LocalError::ProxyParse(format!("mismatched quotes in `{}'", s)))?;
        let mut args = args.into_iter();
        let identity: Identity = args
            .next()
            .ok_or_else(|| LocalError::ProxyParse(format!("no identity in `{}'", s)))?
            .parse()?;
        if identity.is_empty() {
            return Err(LocalError::IllegalIdentity(s.to_string()));
        }

        let mut facet = String::new();
        let mut options = ProxyOptions::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-f" => {
                    facet = args.next().ok_or_else(|| {
                        LocalError::ProxyParse(format!("no argument provided for -f option in `{}'", s))
                    })?;
                }
                "-s" => options.secure = true,
                other => match InvocationMode::from_option(other) {
                    Some(mode) => options.mode = mode,
                    None => {
                        return Err(LocalError::ProxyParse(format!(
                            "unknown option `{}' in `{}'",
                            other, s
                        )))
                    }
                },
            }
        }

        let target = match tail {
            None => Target::Indirect(String::new()),
            Some((b'@', adapter)) => {
                let adapter = split_args(adapter)
                    .map_err(|_| LocalError::ProxyParse(format!("mismatched quotes in `{}'", s)))?;
                match adapter.as_slice() {
                    [id] if !id.is_empty() => Target::Indirect(id.clone()),
                    _ => {
                        return Err(LocalError::ProxyParse(format!(
                            "invalid adapter id in `{}'",
                            s
                        )))
                    }
                }
            }
            Some((_, list)) => {
                let specs = split_endpoint_list(list);
                let mut parsed = Vec::new();
                for spec in &specs {
                    match endpoints.create(spec, false)? {
                        Some(endpoint) => parsed.push(endpoint),
                        None => warn!("proxy contains unknown endpoint `{}'", spec),
                    }
                }
                if parsed.is_empty() && !specs.is_empty() {
                    return Err(LocalError::EndpointParse(format!(
                        "invalid endpoint `{}' in `{}'",
                        list, s
                    )));
                }
                Target::Direct(parsed)
            }
        };

        Ok(Self {
            identity,
            facet,
            options,
            target,
            router: None,
        })
    }
}

/// Position of the first `:` or `@` outside quotes and escapes
fn find_target_separator(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\\' => escaped = true,
                '"' | '\'' => quote = Some(c),
                ':' | '@' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity = self.identity.to_string();
        if identity.contains(|c: char| c == '\'' || c == '"') {
            write!(f, "\"{}\"", identity)?;
        } else {
            f.write_str(&identity)?;
        }
        if !self.facet.is_empty() {
            write!(f, " -f \"{}\"", self.facet)?;
        }
        write!(f, " {}", self.options.mode.option())?;
        if self.options.secure {
            f.write_str(" -s")?;
        }
        match &self.target {
            Target::Direct(endpoints) => {
                for endpoint in endpoints {
                    write!(f, ":{}", endpoint)?;
                }
                Ok(())
            }
            Target::Indirect(id) if id.is_empty() => Ok(()),
            Target::Indirect(id) => {
                if id.contains(|c: char| c.is_whitespace() || c == ':' || c == '@') {
                    write!(f, " @ \"{}\"", id)
                } else {
                    write!(f, " @ {}", id)
                }
            }
        }
    }
}
