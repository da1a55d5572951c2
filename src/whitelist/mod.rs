//! Proxy Source Whitelist
//!
//! Decides which transport peers are trusted to declare a PROXY header.
//!
//! # Rule file
//! ```text
//! # comment
//! 10.0.0.0/8          CIDR range
//! 192.0.2.10          single address
//! lb.example.net      hostname, resolved once at load time
//! ```
//!
//! An empty rule list denies every proxied connection. Putting
//! [`DISABLE_TOKEN`] on the first rule line turns the whitelist off and
//! trusts every source.

mod matcher;
mod warning;

pub use matcher::{AddressFamily, AddressMatcher};
pub use warning::RejectionWarnings;

use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// First-rule sentinel that disables the whitelist entirely
pub const DISABLE_TOKEN: &str =
    "YesIReallyWantToDisableWhitelistItsExtremelyDangerousButIKnowWhatIAmDoing";

/// Content written when no rule file exists yet: loopback only.
pub const DEFAULT_WHITELIST: &str = concat!(
    "# Each line is an IP address, a CIDR range or a hostname. An empty whitelist denies every proxied connection.\n",
    "# Putting YesIReallyWantToDisableWhitelistItsExtremelyDangerousButIKnowWhatIAmDoing on the first rule line disables the whitelist and accepts every proxied connection.\n",
    "# Hostnames are resolved once at startup; every A/AAAA record they return is allowed.\n",
    "# Hostnames may not carry a CIDR prefix length.\n",
    "\n",
    "127.0.0.0/8\n",
    "::1/128\n",
);

/// Errors raised while loading the rule file. All of them are fatal at startup.
#[derive(Debug)]
pub enum WhitelistError {
    /// Rule file could not be read or created
    Io { path: PathBuf, source: io::Error },
    /// A rule line is neither an address, a CIDR range nor a hostname
    InvalidRule {
        line: usize,
        rule: String,
        reason: String,
    },
    /// A hostname rule could not be resolved
    Resolve {
        line: usize,
        host: String,
        source: io::Error,
    },
}

impl fmt::Display for WhitelistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhitelistError::Io { path, source } => {
                write!(f, "whitelist file {}: {}", path.display(), source)
            }
            WhitelistError::InvalidRule { line, rule, reason } => {
                write!(f, "invalid whitelist rule '{}' on line {}: {}", rule, line, reason)
            }
            WhitelistError::Resolve { line, host, source } => {
                write!(f, "cannot resolve '{}' on line {}: {}", host, line, source)
            }
        }
    }
}

impl std::error::Error for WhitelistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WhitelistError::Io { source, .. } | WhitelistError::Resolve { source, .. } => {
                Some(source)
            }
            WhitelistError::InvalidRule { .. } => None,
        }
    }
}

/// An ordered, immutable list of trusted network ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    entries: Vec<AddressMatcher>,
}

impl Whitelist {
    pub fn new(entries: Vec<AddressMatcher>) -> Self {
        Self { entries }
    }

    /// True iff some entry of the same family shares the address's prefix.
    ///
    /// IPv4-mapped IPv6 addresses are compared as IPv4.
    pub fn matches(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.entries.iter().any(|entry| entry.contains(addr))
    }

    pub fn entries(&self) -> &[AddressMatcher] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Whitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", entry)?;
        }
        write!(f, "]")
    }
}

/// The active trust posture: either a rule list or the disabled sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistPolicy {
    /// Every source may send a PROXY header. Dangerous.
    Disabled,
    /// Only sources matching the list may send a PROXY header.
    Enforced(Whitelist),
}

impl WhitelistPolicy {
    pub fn allows(&self, addr: IpAddr) -> bool {
        match self {
            WhitelistPolicy::Disabled => true,
            WhitelistPolicy::Enforced(list) => list.matches(addr),
        }
    }

    /// Match on the peer's IP; the port is ignored.
    pub fn allows_peer(&self, peer: SocketAddr) -> bool {
        self.allows(peer.ip())
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, WhitelistPolicy::Disabled)
    }

    /// Emit the load-time warnings for permissive or deny-all postures.
    pub fn log_posture(&self) {
        match self {
            WhitelistPolicy::Disabled => {
                warn!("!!! ==============================");
                warn!("!!! The proxy whitelist is DISABLED in its configuration.");
                warn!("!!! Any client can spoof its address with a PROXY header.");
                warn!("!!! Never run like this in production!");
                warn!("!!! ==============================");
            }
            WhitelistPolicy::Enforced(list) if list.is_empty() => {
                warn!("Proxy whitelist is empty; every proxied connection will be refused");
            }
            WhitelistPolicy::Enforced(list) => {
                info!(entries = list.len(), whitelist = %list, "Proxy whitelist loaded");
            }
        }
    }
}

/// Parse rule text, resolving hostnames with the system resolver.
pub fn parse(text: &str) -> Result<WhitelistPolicy, WhitelistError> {
    parse_with(text, system_resolve)
}

/// Parse rule text with a caller-supplied hostname resolver.
pub fn parse_with<R>(text: &str, mut resolve: R) -> Result<WhitelistPolicy, WhitelistError>
where
    R: FnMut(&str) -> io::Result<Vec<IpAddr>>,
{
    let mut entries = Vec::new();
    let mut first = true;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if first && line == DISABLE_TOKEN {
            return Ok(WhitelistPolicy::Disabled);
        }
        first = false;

        parse_rule(idx + 1, line, &mut resolve, &mut entries)?;
    }

    Ok(WhitelistPolicy::Enforced(Whitelist::new(entries)))
}

fn parse_rule<R>(
    line: usize,
    rule: &str,
    resolve: &mut R,
    out: &mut Vec<AddressMatcher>,
) -> Result<(), WhitelistError>
where
    R: FnMut(&str) -> io::Result<Vec<IpAddr>>,
{
    let invalid = |reason: String| WhitelistError::InvalidRule {
        line,
        rule: rule.to_string(),
        reason,
    };

    if let Some((addr, prefix)) = rule.split_once('/') {
        let addr: IpAddr = addr.trim().parse().map_err(|_| {
            invalid("a prefix length requires a literal IP address; hostnames may not carry one".to_string())
        })?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|_| invalid(format!("bad prefix length '{}'", prefix)))?;
        let matcher = AddressMatcher::new(addr, prefix).map_err(|e| invalid(e.to_string()))?;
        out.push(matcher);
        return Ok(());
    }

    if let Ok(addr) = rule.parse::<IpAddr>() {
        out.push(AddressMatcher::host(addr));
        return Ok(());
    }

    if !is_hostname(rule) {
        return Err(invalid("not an IP address, CIDR range or hostname".to_string()));
    }

    let resolved = resolve(rule).map_err(|source| WhitelistError::Resolve {
        line,
        host: rule.to_string(),
        source,
    })?;
    if resolved.is_empty() {
        return Err(WhitelistError::Resolve {
            line,
            host: rule.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no A/AAAA records"),
        });
    }

    debug!(host = rule, addresses = ?resolved, "Resolved whitelist hostname");
    out.extend(resolved.into_iter().map(AddressMatcher::host));
    Ok(())
}

fn is_hostname(s: &str) -> bool {
    s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Resolve every A/AAAA record of `host`, keeping first-seen order.
pub fn system_resolve(host: &str) -> io::Result<Vec<IpAddr>> {
    let mut addrs: Vec<IpAddr> = Vec::new();
    for sock in (host, 0u16).to_socket_addrs()? {
        let ip = sock.ip();
        if !addrs.contains(&ip) {
            addrs.push(ip);
        }
    }
    Ok(addrs)
}

/// Read and parse an existing rule file.
pub fn load(path: &Path) -> Result<WhitelistPolicy, WhitelistError> {
    let text = fs::read_to_string(path).map_err(|source| WhitelistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

/// Load the rule file, first writing the loopback-only default if it is missing.
pub fn load_or_initialize(path: &Path) -> Result<WhitelistPolicy, WhitelistError> {
    if !path.exists() {
        let io_err = |source| WhitelistError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, DEFAULT_WHITELIST).map_err(io_err)?;
        info!(path = %path.display(), "Wrote default proxy whitelist");
    }
    load(path)
}
