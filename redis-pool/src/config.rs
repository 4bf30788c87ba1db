//! Connection configuration and connection-URL parsing.
//!
//! A [`ConnectionConfig`] describes one endpoint. It is shared by every
//! connection a pool creates and never changes after the pool is built.

use crate::{Error, Result, DEFAULT_PORT};
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where to connect.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionAddr {
    Tcp { host: String, port: u16 },
    Tls { host: String, port: u16, tls: TlsOptions },
    Unix(PathBuf),
}

/// Certificate verification policy for TLS endpoints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CertReqs {
    None,
    Optional,
    #[default]
    Required,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TlsOptions {
    pub cert_reqs: CertReqs,
    pub check_hostname: bool,
    /// PEM bundle of trusted roots.
    pub ca_certs: Option<PathBuf>,
    /// PEM client certificate, used together with `keyfile`.
    pub certfile: Option<PathBuf>,
    /// PKCS#8 PEM private key.
    pub keyfile: Option<PathBuf>,
}

impl Default for TlsOptions {
    fn default() -> TlsOptions {
        TlsOptions {
            cert_reqs: CertReqs::Required,
            check_hostname: true,
            ca_certs: None,
            certfile: None,
            keyfile: None,
        }
    }
}

/// Everything needed to open and initialize one connection.
#[derive(Clone, PartialEq)]
pub struct ConnectionConfig {
    pub addr: ConnectionAddr,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    pub client_name: Option<String>,
    /// Bound on every read and write. `None` waits forever.
    pub socket_timeout: Option<Duration>,
    /// Bound on establishing the transport. Defaults to `socket_timeout`.
    pub socket_connect_timeout: Option<Duration>,
    pub socket_keepalive: bool,
    /// Stored for callers that implement their own retry policy.
    pub retry_on_timeout: bool,
    /// Idle time after which the connection is PINGed before use.
    pub health_check_interval: Option<Duration>,
    /// Unrecognized URL query options, kept verbatim.
    pub extra: BTreeMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            addr: ConnectionAddr::Tcp {
                host: "localhost".to_string(),
                port: DEFAULT_PORT,
            },
            username: None,
            password: None,
            db: 0,
            client_name: None,
            socket_timeout: None,
            socket_connect_timeout: None,
            socket_keepalive: false,
            retry_on_timeout: false,
            health_check_interval: None,
            extra: BTreeMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// A TCP endpoint with every other option at its default.
    pub fn tcp(host: impl Into<String>, port: u16) -> ConnectionConfig {
        ConnectionConfig {
            addr: ConnectionAddr::Tcp {
                host: host.into(),
                port,
            },
            ..ConnectionConfig::default()
        }
    }

    /// A Unix domain socket endpoint.
    pub fn unix(path: impl Into<PathBuf>) -> ConnectionConfig {
        ConnectionConfig {
            addr: ConnectionAddr::Unix(path.into()),
            ..ConnectionConfig::default()
        }
    }

    /// Name of the connection flavor, as used in textual representations.
    pub fn kind(&self) -> &'static str {
        match self.addr {
            ConnectionAddr::Tcp { .. } => "Connection",
            ConnectionAddr::Tls { .. } => "TlsConnection",
            ConnectionAddr::Unix(_) => "UnixDomainSocketConnection",
        }
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.socket_connect_timeout.or(self.socket_timeout)
    }
}

/// Renders as `Connection<host=localhost,port=6379,db=0>`. Credentials are never shown.
impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<", self.kind())?;
        match &self.addr {
            ConnectionAddr::Tcp { host, port } | ConnectionAddr::Tls { host, port, .. } => {
                write!(f, "host={host},port={port},db={}", self.db)?;
            }
            ConnectionAddr::Unix(path) => write!(f, "path={},db={}", path.display(), self.db)?,
        }
        if let Some(name) = &self.client_name {
            write!(f, ",client_name={name}")?;
        }
        write!(f, ">")
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("addr", &self.addr)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("client_name", &self.client_name)
            .field("socket_timeout", &self.socket_timeout)
            .field("socket_connect_timeout", &self.socket_connect_timeout)
            .field("socket_keepalive", &self.socket_keepalive)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("health_check_interval", &self.health_check_interval)
            .field("extra", &self.extra)
            .finish()
    }
}

/// Result of [`parse_url`]: the endpoint plus pool-level options found in the URL.
#[derive(Clone, Debug, Default)]
pub struct UrlOptions {
    pub config: ConnectionConfig,
    pub max_connections: Option<usize>,
}

/// Interprets a boolean URL option.
///
/// Matching is case-insensitive. `1 t true y yes` are true, `0 f false n no`
/// are false and the empty string is `None`. Anything else is an error.
pub fn to_bool(value: &str) -> Result<Option<bool>> {
    match value.to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "t" | "true" | "y" | "yes" => Ok(Some(true)),
        "0" | "f" | "false" | "n" | "no" => Ok(Some(false)),
        _ => Err(Error::InvalidConfig(format!(
            "Invalid boolean value `{value}`"
        ))),
    }
}

/// Parses `redis://`, `rediss://` and `unix://` URLs.
///
/// ```text
/// redis://[[username]:[password]@]host[:port][/db][?option=value...]
/// rediss://[[username]:[password]@]host[:port][/db][?option=value...]
/// unix://[[username]:[password]@]/path/to/socket[?db=n&option=value...]
/// ```
///
/// User info, host and path are percent-decoded. A `db` query option wins over
/// the path.
pub fn parse_url(url: &str) -> Result<UrlOptions> {
    let (scheme, rest) = url.split_once("://").ok_or_else(invalid_scheme)?;
    let scheme = scheme.to_ascii_lowercase();
    if !matches!(scheme.as_str(), "redis" | "rediss" | "unix") {
        return Err(invalid_scheme());
    }

    let rest = rest.split_once('#').map_or(rest, |(before, _)| before);
    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, Some(query)),
        None => (rest, None),
    };
    let (netloc, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    let (userinfo, hostport) = match netloc.rsplit_once('@') {
        Some((userinfo, hostport)) => (Some(userinfo), hostport),
        None => (None, netloc),
    };

    let mut config = ConnectionConfig::default();
    if let Some(userinfo) = userinfo {
        let (username, password) = match userinfo.split_once(':') {
            Some((user, pass)) => (user, Some(pass)),
            None => (userinfo, None),
        };
        config.username = non_empty(decode(username)?);
        config.password = password.map(decode).transpose()?.and_then(non_empty);
    }

    if scheme == "unix" {
        let path = decode(path)?;
        if path.is_empty() {
            return Err(Error::InvalidConfig(
                "Unix socket URL must contain a path".to_string(),
            ));
        }
        config.addr = ConnectionAddr::Unix(PathBuf::from(path));
    } else {
        let (host, port) = split_host_port(hostport)?;
        let host = non_empty(decode(host)?).unwrap_or_else(|| "localhost".to_string());
        let port = port.unwrap_or(DEFAULT_PORT);

        config.addr = if scheme == "rediss" {
            ConnectionAddr::Tls {
                host,
                port,
                tls: TlsOptions::default(),
            }
        } else {
            ConnectionAddr::Tcp { host, port }
        };

        let db = path.trim_start_matches('/');
        if !db.is_empty() {
            config.db = db.parse().map_err(|_| invalid_value("db"))?;
        }
    }

    let mut options = UrlOptions {
        config,
        max_connections: None,
    };
    if let Some(query) = query {
        apply_query(&mut options, query)?;
    }

    Ok(options)
}

fn apply_query(options: &mut UrlOptions, query: &str) -> Result<()> {
    let mut seen = Vec::new();

    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        // Only the first occurrence of a key counts.
        if seen.contains(&name) {
            continue;
        }
        seen.push(name.clone());

        if value.is_empty() {
            continue;
        }

        let config = &mut options.config;
        match name.as_ref() {
            "db" => config.db = value.parse().map_err(|_| invalid_value(&name))?,
            "max_connections" => {
                options.max_connections = Some(value.parse().map_err(|_| invalid_value(&name))?);
            }
            "socket_timeout" => config.socket_timeout = Some(seconds(&name, &value)?),
            "socket_connect_timeout" => {
                config.socket_connect_timeout = Some(seconds(&name, &value)?);
            }
            "health_check_interval" => {
                let interval = seconds(&name, &value)?;
                config.health_check_interval = (!interval.is_zero()).then_some(interval);
            }
            "socket_keepalive" => config.socket_keepalive = boolean(&name, &value)?,
            "retry_on_timeout" => config.retry_on_timeout = boolean(&name, &value)?,
            "client_name" => config.client_name = Some(value.into_owned()),
            "ssl_check_hostname" => {
                let check = boolean(&name, &value)?;
                if let Some(tls) = tls_options(config) {
                    tls.check_hostname = check;
                }
            }
            "ssl_cert_reqs" => {
                let reqs = match value.to_ascii_lowercase().as_str() {
                    "none" => CertReqs::None,
                    "optional" => CertReqs::Optional,
                    "required" => CertReqs::Required,
                    _ => return Err(invalid_value(&name)),
                };
                if let Some(tls) = tls_options(config) {
                    tls.cert_reqs = reqs;
                }
            }
            "ssl_ca_certs" | "ssl_certfile" | "ssl_keyfile" => {
                let path = Some(PathBuf::from(value.as_ref()));
                if let Some(tls) = tls_options(config) {
                    match name.as_ref() {
                        "ssl_ca_certs" => tls.ca_certs = path,
                        "ssl_certfile" => tls.certfile = path,
                        _ => tls.keyfile = path,
                    }
                }
            }
            _ => {
                config.extra.insert(name.into_owned(), value.into_owned());
            }
        }
    }

    Ok(())
}

fn tls_options(config: &mut ConnectionConfig) -> Option<&mut TlsOptions> {
    match &mut config.addr {
        ConnectionAddr::Tls { tls, .. } => Some(tls),
        _ => None,
    }
}

fn split_host_port(hostport: &str) -> Result<(&str, Option<u16>)> {
    let parse_port = |port: &str| -> Result<Option<u16>> {
        if port.is_empty() {
            return Ok(None);
        }
        port.parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("Invalid port `{port}` in connection URL.")))
    };

    // IPv6 literal: [::1]:6379
    if let Some(bracketed) = hostport.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or_else(|| {
            Error::InvalidConfig("Invalid IPv6 host in connection URL.".to_string())
        })?;
        let port = match after.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None => None,
        };
        return Ok((host, port));
    }

    match hostport.rsplit_once(':') {
        Some((host, port)) => Ok((host, parse_port(port)?)),
        None => Ok((hostport, None)),
    }
}

fn seconds(name: &str, value: &str) -> Result<Duration> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| invalid_value(name))
}

fn boolean(name: &str, value: &str) -> Result<bool> {
    match to_bool(value) {
        Ok(Some(b)) => Ok(b),
        _ => Err(invalid_value(name)),
    }
}

fn decode(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Error::InvalidConfig("connection URL is not valid UTF-8".to_string()))
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn invalid_value(name: &str) -> Error {
    Error::InvalidConfig(format!("Invalid value for `{name}` in connection URL."))
}

fn invalid_scheme() -> Error {
    Error::InvalidConfig(
        "Redis URL must specify one of the following schemes (redis://, rediss://, unix://)"
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(url: &str) -> (String, u16, ConnectionConfig) {
        let config = parse_url(url).unwrap().config;
        match &config.addr {
            ConnectionAddr::Tcp { host, port } => (host.clone(), *port, config.clone()),
            other => panic!("expected tcp, got {other:?}"),
        }
    }

    #[test]
    fn hostname_and_port() {
        let (host, port, _) = tcp("redis://my.host");
        assert_eq!((host.as_str(), port), ("my.host", 6379));

        let (host, port, _) = tcp("redis://localhost:6380");
        assert_eq!((host.as_str(), port), ("localhost", 6380));
    }

    #[test]
    fn quoted_hostname_keeps_plus() {
        let (host, _, _) = tcp("redis://my %2F host %2B%3D+");
        assert_eq!(host, "my / host +=+");
    }

    #[test]
    fn credentials() {
        let (_, _, config) = tcp("redis://myuser:@localhost");
        assert_eq!(config.username.as_deref(), Some("myuser"));
        assert_eq!(config.password, None);

        let (_, _, config) = tcp("redis://:mypassword@localhost");
        assert_eq!(config.username, None);
        assert_eq!(config.password.as_deref(), Some("mypassword"));

        let (_, _, config) = tcp("redis://%2Fmyuser%2F%2B name%3D%24+:%2Fmypass%2F%2B word%3D%24+@localhost");
        assert_eq!(config.username.as_deref(), Some("/myuser/+ name=$+"));
        assert_eq!(config.password.as_deref(), Some("/mypass/+ word=$+"));
    }

    #[test]
    fn db_from_path_and_query() {
        assert_eq!(tcp("redis://localhost").2.db, 0);
        assert_eq!(tcp("redis://localhost/2").2.db, 2);
        assert_eq!(tcp("redis://localhost/2?db=3").2.db, 3);
        assert!(matches!(
            parse_url("redis://localhost/abc"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn typed_query_options() {
        let opts = parse_url(
            "redis://localhost/2?socket_timeout=20&socket_connect_timeout=10\
             &socket_keepalive=&retry_on_timeout=Yes&max_connections=10",
        )
        .unwrap();
        assert_eq!(opts.config.db, 2);
        assert_eq!(opts.config.socket_timeout, Some(Duration::from_secs(20)));
        assert_eq!(opts.config.socket_connect_timeout, Some(Duration::from_secs(10)));
        assert!(!opts.config.socket_keepalive);
        assert!(opts.config.retry_on_timeout);
        assert_eq!(opts.max_connections, Some(10));
        assert!(opts.config.extra.is_empty());
    }

    #[test]
    fn invalid_typed_option() {
        let err = parse_url("redis://localhost/2?socket_timeout=_&socket_connect_timeout=abc")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for `socket_timeout` in connection URL."
        );
    }

    #[test]
    fn extra_options_and_client_name() {
        let (_, _, config) = tcp("redis://localhost?a=1&b=2");
        assert_eq!(config.extra.get("a").map(String::as_str), Some("1"));
        assert_eq!(config.extra.get("b").map(String::as_str), Some("2"));

        let (_, _, config) = tcp("redis://location?client_name=test-client");
        assert_eq!(config.client_name.as_deref(), Some("test-client"));
    }

    #[test]
    fn invalid_scheme() {
        let err = parse_url("localhost").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Redis URL must specify one of the following schemes (redis://, rediss://, unix://)"
        );
        assert!(parse_url("http://localhost").is_err());
    }

    #[test]
    fn unix_sockets() {
        let opts = parse_url("unix:///socket").unwrap();
        assert_eq!(opts.config.addr, ConnectionAddr::Unix("/socket".into()));

        let opts = parse_url("unix://:mypassword@/my%2Fpath%2Fto%2F..%2F+_%2B%3D%24ocket").unwrap();
        assert_eq!(opts.config.password.as_deref(), Some("mypassword"));
        assert_eq!(
            opts.config.addr,
            ConnectionAddr::Unix("/my/path/to/../+_+=$ocket".into())
        );

        let opts = parse_url("unix://myuser:@/socket?db=2&a=1").unwrap();
        assert_eq!(opts.config.username.as_deref(), Some("myuser"));
        assert_eq!(opts.config.db, 2);
        assert_eq!(opts.config.extra.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn tls_query_options() {
        let opts = parse_url("rediss://?ssl_cert_reqs=none&ssl_check_hostname=False").unwrap();
        assert_eq!(opts.config.kind(), "TlsConnection");
        match opts.config.addr {
            ConnectionAddr::Tls { host, port, tls } => {
                assert_eq!(host, "localhost");
                assert_eq!(port, 6379);
                assert_eq!(tls.cert_reqs, CertReqs::None);
                assert!(!tls.check_hostname);
            }
            other => panic!("expected tls, got {other:?}"),
        }

        for (value, expected) in [("optional", CertReqs::Optional), ("required", CertReqs::Required)] {
            let opts = parse_url(&format!("rediss://my.host?ssl_cert_reqs={value}")).unwrap();
            match opts.config.addr {
                ConnectionAddr::Tls { tls, .. } => assert_eq!(tls.cert_reqs, expected),
                other => panic!("expected tls, got {other:?}"),
            }
        }
    }

    #[test]
    fn ipv6_host() {
        let (host, port, _) = tcp("redis://[::1]:6380/1");
        assert_eq!((host.as_str(), port), ("::1", 6380));
    }

    #[test]
    fn health_check_interval_zero_disables() {
        let (_, _, config) = tcp("redis://localhost?health_check_interval=0");
        assert_eq!(config.health_check_interval, None);
        let (_, _, config) = tcp("redis://localhost?health_check_interval=0.5");
        assert_eq!(config.health_check_interval, Some(Duration::from_millis(500)));
    }

    #[test]
    fn boolean_vocabulary() {
        for (expected, value) in [
            (None, ""),
            (Some(false), "0"),
            (Some(false), "f"),
            (Some(false), "F"),
            (Some(false), "False"),
            (Some(false), "n"),
            (Some(false), "N"),
            (Some(false), "No"),
            (Some(true), "1"),
            (Some(true), "y"),
            (Some(true), "Y"),
            (Some(true), "Yes"),
            (Some(true), "TRUE"),
        ] {
            assert_eq!(to_bool(value).unwrap(), expected, "{value}");
        }
        assert!(to_bool("maybe").is_err());
    }

    #[test]
    fn display_hides_password() {
        let mut config = ConnectionConfig::tcp("localhost", 6379);
        config.db = 1;
        config.client_name = Some("test-client".into());
        config.password = Some("secret".into());
        assert_eq!(
            config.to_string(),
            "Connection<host=localhost,port=6379,db=1,client_name=test-client>"
        );
        assert!(!format!("{config:?}").contains("secret"));

        let mut config = ConnectionConfig::unix("/abc");
        config.db = 1;
        config.client_name = Some("test-client".into());
        assert_eq!(
            config.to_string(),
            "UnixDomainSocketConnection<path=/abc,db=1,client_name=test-client>"
        );
    }
}
