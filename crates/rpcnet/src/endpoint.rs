//! Endpoints and endpoint-string parsing
//!
//! An endpoint string names a transport followed by options, for example
//! `tcp -h 127.0.0.1 -p 10000 -t 5000`. Lists of endpoints are separated by
//! unquoted colons.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::warn;

use crate::error::{LocalError, Result};
use crate::network;
use crate::properties::Properties;

/// Default connect/read timeout in milliseconds
pub const DEFAULT_TIMEOUT: i32 = 60_000;

/// Transports this runtime knows about but cannot serve
pub const UNAVAILABLE_TRANSPORTS: &[&str] = &["ssl", "ws", "wss"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Tcp,
    Udp,
    Opaque,
}

impl Transport {
    pub fn name(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Opaque => "opaque",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
    pub source_address: Option<String>,
    /// Milliseconds, -1 for no timeout
    pub timeout: i32,
    pub compress: bool,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UdpEndpoint {
    pub host: String,
    pub port: u16,
    pub source_address: Option<String>,
    pub connect: bool,
    pub compress: bool,
    pub mcast_interface: String,
    pub mcast_ttl: i32,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpaqueEndpoint {
    pub kind: u16,
    pub encoding: (u8, u8),
    pub bytes: Vec<u8>,
}

/// A parsed endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Tcp(TcpEndpoint),
    Udp(UdpEndpoint),
    Opaque(OpaqueEndpoint),
}

impl Endpoint {
    pub fn transport(&self) -> Transport {
        match self {
            Endpoint::Tcp(_) => Transport::Tcp,
            Endpoint::Udp(_) => Transport::Udp,
            Endpoint::Opaque(_) => Transport::Opaque,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Endpoint::Tcp(e) => &e.host,
            Endpoint::Udp(e) => &e.host,
            Endpoint::Opaque(_) => "",
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Tcp(e) => e.port,
            Endpoint::Udp(e) => e.port,
            Endpoint::Opaque(_) => 0,
        }
    }

    pub fn timeout(&self) -> i32 {
        match self {
            Endpoint::Tcp(e) => e.timeout,
            _ => -1,
        }
    }

    pub fn compress(&self) -> bool {
        match self {
            Endpoint::Tcp(e) => e.compress,
            Endpoint::Udp(e) => e.compress,
            Endpoint::Opaque(_) => false,
        }
    }

    pub fn datagram(&self) -> bool {
        matches!(self, Endpoint::Udp(_))
    }

    pub fn secure(&self) -> bool {
        false
    }

    pub fn connection_id(&self) -> &str {
        match self {
            Endpoint::Tcp(e) => &e.connection_id,
            Endpoint::Udp(e) => &e.connection_id,
            Endpoint::Opaque(_) => "",
        }
    }

    /// Copy with another port, used once a listener has bound port 0
    pub fn with_port(&self, port: u16) -> Endpoint {
        let mut ep = self.clone();
        match &mut ep {
            Endpoint::Tcp(e) => e.port = port,
            Endpoint::Udp(e) => e.port = port,
            Endpoint::Opaque(_) => {}
        }
        ep
    }

    pub fn with_host(&self, host: impl Into<String>) -> Endpoint {
        let mut ep = self.clone();
        match &mut ep {
            Endpoint::Tcp(e) => e.host = host.into(),
            Endpoint::Udp(e) => e.host = host.into(),
            Endpoint::Opaque(_) => {}
        }
        ep
    }

    pub fn with_connection_id(&self, id: impl Into<String>) -> Endpoint {
        let mut ep = self.clone();
        match &mut ep {
            Endpoint::Tcp(e) => e.connection_id = id.into(),
            Endpoint::Udp(e) => e.connection_id = id.into(),
            Endpoint::Opaque(_) => {}
        }
        ep
    }

    /// Same transport, host and port. Timeouts, compression and other
    /// options are ignored.
    pub fn equivalent(&self, other: &Endpoint) -> bool {
        match (self, other) {
            (Endpoint::Opaque(_), _) | (_, Endpoint::Opaque(_)) => false,
            _ => {
                self.transport() == other.transport()
                    && self.host() == other.host()
                    && self.port() == other.port()
            }
        }
    }

    /// Replace a wildcard host with the concrete local addresses
    pub fn expand(&self) -> Vec<Endpoint> {
        if matches!(self, Endpoint::Opaque(_)) || !network::is_wildcard(self.host()) {
            return vec![self.clone()];
        }
        network::local_hosts()
            .into_iter()
            .map(|h| self.with_host(h))
            .collect()
    }
}

fn write_host(f: &mut fmt::Formatter<'_>, host: &str) -> fmt::Result {
    if host.is_empty() {
        return Ok(());
    }
    if host.contains(':') {
        write!(f, " -h \"{}\"", host)
    } else {
        write!(f, " -h {}", host)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(e) => {
                f.write_str("tcp")?;
                write_host(f, &e.host)?;
                write!(f, " -p {}", e.port)?;
                if let Some(addr) = &e.source_address {
                    write!(f, " --sourceAddress {}", addr)?;
                }
                if e.timeout == -1 {
                    f.write_str(" -t infinite")?;
                } else {
                    write!(f, " -t {}", e.timeout)?;
                }
                if e.compress {
                    f.write_str(" -z")?;
                }
                Ok(())
            }
            Endpoint::Udp(e) => {
                f.write_str("udp")?;
                write_host(f, &e.host)?;
                write!(f, " -p {}", e.port)?;
                if let Some(addr) = &e.source_address {
                    write!(f, " --sourceAddress {}", addr)?;
                }
                if !e.mcast_interface.is_empty() {
                    write!(f, " --interface {}", e.mcast_interface)?;
                }
                if e.mcast_ttl != -1 {
                    write!(f, " --ttl {}", e.mcast_ttl)?;
                }
                if e.connect {
                    f.write_str(" -c")?;
                }
                if e.compress {
                    f.write_str(" -z")?;
                }
                Ok(())
            }
            Endpoint::Opaque(e) => write!(
                f,
                "opaque -t {} -e {}.{} -v {}",
                e.kind,
                e.encoding.0,
                e.encoding.1,
                BASE64.encode(&e.bytes)
            ),
        }
    }
}

/// Split on whitespace, honoring single and double quotes
pub fn split_args(s: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err(LocalError::EndpointParse(format!(
            "mismatched quotes in endpoint `{}'",
            s
        )));
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

/// Split an endpoint list into individual endpoint strings.
///
/// Specs are separated by `:` unless the colon sits inside a double-quoted
/// section (an IPv6 host, for instance). Leading whitespace is skipped and
/// empty specs are dropped.
pub fn split_endpoint_list(list: &str) -> Vec<&str> {
    const DELIMITERS: &[char] = &[' ', '\t', '\n', '\r'];
    let mut specs = Vec::new();
    let mut end = 0;

    while end < list.len() {
        let beg = match list[end..].find(|c: char| !DELIMITERS.contains(&c)) {
            Some(offset) => end + offset,
            None => break,
        };

        end = beg;
        loop {
            match list[end..].find(':') {
                None => {
                    end = list.len();
                    break;
                }
                Some(offset) => {
                    end += offset;
                    // Is this colon inside a quoted section?
                    let mut quoted = false;
                    let mut quote = beg;
                    loop {
                        let open = match list[quote..].find('"') {
                            Some(o) => quote + o,
                            None => break,
                        };
                        if end < open {
                            break;
                        }
                        let close = match list[open + 1..].find('"') {
                            Some(o) => open + 1 + o,
                            None => break,
                        };
                        if end < close {
                            quoted = true;
                            break;
                        }
                        quote = close + 1;
                    }
                    if !quoted {
                        break;
                    }
                    end += 1;
                }
            }
        }

        if end > beg {
            specs.push(&list[beg..end]);
        }
        // Step over the separator
        end += 1;
    }

    specs
}

/// Defaults applied to endpoints that omit options
#[derive(Debug, Clone)]
pub struct EndpointDefaults {
    pub host: Option<String>,
    pub protocol: String,
    pub timeout: i32,
}

impl Default for EndpointDefaults {
    fn default() -> Self {
        Self {
            host: None,
            protocol: "tcp".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl EndpointDefaults {
    pub fn from_properties(props: &Properties) -> Self {
        let host = props.get_property("Rpc.Default.Host");
        let mut timeout =
            props.get_property_as_int_with_default("Rpc.Default.Timeout", DEFAULT_TIMEOUT as i64);
        if timeout < 1 && timeout != -1 {
            warn!(
                "invalid value for Rpc.Default.Timeout `{}': defaulting to {}",
                timeout, DEFAULT_TIMEOUT
            );
            timeout = DEFAULT_TIMEOUT as i64;
        }
        Self {
            host: if host.is_empty() { None } else { Some(host) },
            protocol: props.get_property_with_default("Rpc.Default.Protocol", "tcp"),
            timeout: timeout.clamp(-1, i32::MAX as i64) as i32,
        }
    }
}

/// Creates endpoints from their string form
#[derive(Debug, Clone, Default)]
pub struct EndpointFactoryManager {
    defaults: EndpointDefaults,
}

impl EndpointFactoryManager {
    pub fn new(defaults: EndpointDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &EndpointDefaults {
        &self.defaults
    }

    /// True if `spec` names a transport known to exist but not provided by
    /// this runtime
    pub fn is_unavailable_transport(spec: &str) -> bool {
        let protocol = spec.split_whitespace().next().unwrap_or("");
        UNAVAILABLE_TRANSPORTS.contains(&protocol)
    }

    /// Parse one endpoint. `Ok(None)` means the transport is not supported.
    ///
    /// `adapter_endpoint` selects the rules for listening endpoints: `-h *`
    /// is allowed and `--sourceAddress` is not.
    pub fn create(&self, spec: &str, adapter_endpoint: bool) -> Result<Option<Endpoint>> {
        let mut args = split_args(spec)?;
        if args.is_empty() {
            return Err(LocalError::EndpointParse("value has no non-whitespace characters".into()));
        }

        let mut protocol = args.remove(0);
        if protocol == "default" {
            protocol = self.defaults.protocol.clone();
        }

        let endpoint = match protocol.as_str() {
            "tcp" => {
                let mut ep = TcpEndpoint {
                    host: String::new(),
                    port: 0,
                    source_address: None,
                    timeout: self.defaults.timeout,
                    compress: false,
                    connection_id: String::new(),
                };
                let mut host = None;
                parse_options(spec, &args, |option, argument| {
                    if check_ip_option(
                        spec,
                        option,
                        argument,
                        &mut host,
                        &mut ep.port,
                        &mut ep.source_address,
                        adapter_endpoint,
                    )? {
                        return Ok(true);
                    }
                    match option {
                        "-t" => {
                            let arg = require_argument(spec, option, argument)?;
                            if arg == "infinite" {
                                ep.timeout = -1;
                            } else {
                                ep.timeout = match arg.parse::<i32>() {
                                    Ok(t) if t >= 1 => t,
                                    _ => {
                                        return Err(LocalError::EndpointParse(format!(
                                            "invalid timeout value `{}' in endpoint {}",
                                            arg, spec
                                        )))
                                    }
                                };
                            }
                            Ok(true)
                        }
                        "-z" => {
                            reject_argument(spec, option, argument)?;
                            ep.compress = true;
                            Ok(true)
                        }
                        _ => Ok(false),
                    }
                })?;
                ep.host = self.finish_host(spec, host, adapter_endpoint)?;
                Endpoint::Tcp(ep)
            }
            "udp" => {
                let mut ep = UdpEndpoint {
                    host: String::new(),
                    port: 0,
                    source_address: None,
                    connect: false,
                    compress: false,
                    mcast_interface: String::new(),
                    mcast_ttl: -1,
                    connection_id: String::new(),
                };
                let mut host = None;
                parse_options(spec, &args, |option, argument| {
                    if check_ip_option(
                        spec,
                        option,
                        argument,
                        &mut host,
                        &mut ep.port,
                        &mut ep.source_address,
                        adapter_endpoint,
                    )? {
                        return Ok(true);
                    }
                    match option {
                        "-c" => {
                            reject_argument(spec, option, argument)?;
                            ep.connect = true;
                            Ok(true)
                        }
                        "-z" => {
                            reject_argument(spec, option, argument)?;
                            ep.compress = true;
                            Ok(true)
                        }
                        "--interface" => {
                            ep.mcast_interface = require_argument(spec, option, argument)?.to_string();
                            Ok(true)
                        }
                        "--ttl" => {
                            let arg = require_argument(spec, option, argument)?;
                            ep.mcast_ttl = match arg.parse::<i32>() {
                                Ok(t) if t >= 0 => t,
                                _ => {
                                    return Err(LocalError::EndpointParse(format!(
                                        "invalid TTL value `{}' in endpoint {}",
                                        arg, spec
                                    )))
                                }
                            };
                            Ok(true)
                        }
                        _ => Ok(false),
                    }
                })?;
                ep.host = self.finish_host(spec, host, adapter_endpoint)?;
                Endpoint::Udp(ep)
            }
            "opaque" => {
                if adapter_endpoint {
                    return Err(LocalError::EndpointParse(format!(
                        "opaque endpoint `{}' cannot be used by an object adapter",
                        spec
                    )));
                }
                let mut kind: Option<u16> = None;
                let mut encoding = (1u8, 1u8);
                let mut bytes: Option<Vec<u8>> = None;
                parse_options(spec, &args, |option, argument| match option {
                    "-t" => {
                        if kind.is_some() {
                            return Err(LocalError::EndpointParse(format!(
                                "multiple -t options in endpoint {}",
                                spec
                            )));
                        }
                        let arg = require_argument(spec, option, argument)?;
                        kind = Some(arg.parse::<u16>().map_err(|_| {
                            LocalError::EndpointParse(format!(
                                "invalid type value `{}' in endpoint {}",
                                arg, spec
                            ))
                        })?);
                        Ok(true)
                    }
                    "-e" => {
                        let arg = require_argument(spec, option, argument)?;
                        encoding = parse_version(arg).ok_or_else(|| {
                            LocalError::EndpointParse(format!(
                                "invalid encoding version `{}' in endpoint {}",
                                arg, spec
                            ))
                        })?;
                        Ok(true)
                    }
                    "-v" => {
                        if bytes.is_some() {
                            return Err(LocalError::EndpointParse(format!(
                                "multiple -v options in endpoint {}",
                                spec
                            )));
                        }
                        let arg = require_argument(spec, option, argument)?;
                        bytes = Some(BASE64.decode(arg).map_err(|_| {
                            LocalError::EndpointParse(format!(
                                "invalid base64 value `{}' in endpoint {}",
                                arg, spec
                            ))
                        })?);
                        Ok(true)
                    }
                    _ => Ok(false),
                })?;
                let kind = kind.ok_or_else(|| {
                    LocalError::EndpointParse(format!("no -t option in endpoint {}", spec))
                })?;
                let bytes = match bytes {
                    Some(b) if !b.is_empty() => b,
                    _ => {
                        return Err(LocalError::EndpointParse(format!(
                            "no -v option in endpoint {}",
                            spec
                        )))
                    }
                };
                Endpoint::Opaque(OpaqueEndpoint {
                    kind,
                    encoding,
                    bytes,
                })
            }
            _ => return Ok(None),
        };

        Ok(Some(endpoint))
    }

    fn finish_host(&self, spec: &str, host: Option<String>, adapter_endpoint: bool) -> Result<String> {
        match host {
            None => Ok(self.defaults.host.clone().unwrap_or_default()),
            Some(h) if h.is_empty() => Ok(self.defaults.host.clone().unwrap_or_default()),
            Some(h) if h == "*" => {
                if adapter_endpoint {
                    Ok(String::new())
                } else {
                    Err(LocalError::EndpointParse(format!(
                        "`-h *' not valid for proxy endpoint `{}'",
                        spec
                    )))
                }
            }
            Some(h) => Ok(h),
        }
    }
}

fn parse_version(s: &str) -> Option<(u8, u8)> {
    let (major, minor) = s.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Walk `-opt [arg]` pairs. An argument is the next token unless it starts
/// with `-`. Options the handler does not recognise are errors.
fn parse_options<F>(spec: &str, args: &[String], mut handler: F) -> Result<()>
where
    F: FnMut(&str, Option<&str>) -> Result<bool>,
{
    let mut n = 0;
    while n < args.len() {
        let option = args[n].as_str();
        if option.len() < 2 || !option.starts_with('-') {
            return Err(LocalError::EndpointParse(format!(
                "expected an endpoint option but found `{}' in endpoint {}",
                option, spec
            )));
        }
        let mut argument = None;
        if n + 1 < args.len() && !args[n + 1].starts_with('-') {
            n += 1;
            argument = Some(args[n].as_str());
        }
        if !handler(option, argument)? {
            return Err(LocalError::EndpointParse(format!(
                "unrecognized option `{}' in endpoint {}",
                option, spec
            )));
        }
        n += 1;
    }
    Ok(())
}

fn require_argument<'a>(spec: &str, option: &str, argument: Option<&'a str>) -> Result<&'a str> {
    argument.ok_or_else(|| {
        LocalError::EndpointParse(format!(
            "no argument provided for {} option in endpoint {}",
            option, spec
        ))
    })
}

fn reject_argument(spec: &str, option: &str, argument: Option<&str>) -> Result<()> {
    match argument {
        None => Ok(()),
        Some(arg) => Err(LocalError::EndpointParse(format!(
            "unexpected argument `{}' provided for {} option in endpoint {}",
            arg, option, spec
        ))),
    }
}

fn check_ip_option(
    spec: &str,
    option: &str,
    argument: Option<&str>,
    host: &mut Option<String>,
    port: &mut u16,
    source_address: &mut Option<String>,
    adapter_endpoint: bool,
) -> Result<bool> {
    match option {
        "-h" => {
            *host = Some(require_argument(spec, option, argument)?.to_string());
            Ok(true)
        }
        "-p" => {
            let arg = require_argument(spec, option, argument)?;
            let value = arg.parse::<i64>().map_err(|_| {
                LocalError::EndpointParse(format!("invalid port value `{}' in endpoint {}", arg, spec))
            })?;
            *port = u16::try_from(value).map_err(|_| {
                LocalError::EndpointParse(format!(
                    "port value `{}' out of range in endpoint {}",
                    arg, spec
                ))
            })?;
            Ok(true)
        }
        "--sourceAddress" => {
            if adapter_endpoint {
                return Err(LocalError::EndpointParse(format!(
                    "`--sourceAddress' not valid for object adapter endpoint `{}'",
                    spec
                )));
            }
            let arg = require_argument(spec, option, argument)?;
            if arg.parse::<std::net::IpAddr>().is_err() {
                return Err(LocalError::EndpointParse(format!(
                    "invalid IP address provided for --sourceAddress option in endpoint {}",
                    spec
                )));
            }
            *source_address = Some(arg.to_string());
            Ok(true)
        }
        _ => Ok(false),
    }
}
