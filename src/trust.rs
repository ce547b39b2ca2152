//! TLS trust override
//!
//! The engine never performs TLS itself. The transport collaborator reports
//! the outcome of its own certificate evaluation as a [`PeerTrust`], and
//! [`evaluate_trust`] decides whether the connection may proceed.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Result of the transport's certificate evaluation
#[derive(Debug, Clone, Default)]
pub struct PeerTrust {
    /// Whether the transport's default policy accepted the chain
    pub default_trusted: bool,
    /// Server name the chain was evaluated against
    pub server_name: Option<String>,
    /// DER-encoded certificate chain, leaf first
    pub certificates: Vec<Bytes>,
}

impl PeerTrust {
    /// Trust outcome with no certificate details
    pub fn new(default_trusted: bool) -> Self {
        Self {
            default_trusted,
            ..Default::default()
        }
    }
}

/// Caller decision on a peer certificate chain
pub trait TrustEvaluator: Send + Sync + 'static {
    /// Return `true` to accept the peer
    fn should_trust(&self, peer: &PeerTrust) -> bool;
}

impl<F> TrustEvaluator for F
where
    F: Fn(&PeerTrust) -> bool + Send + Sync + 'static,
{
    fn should_trust(&self, peer: &PeerTrust) -> bool {
        self(peer)
    }
}

/// Shared trust hook stored in [`TlsOptions`]
#[derive(Clone)]
pub struct TrustHook(Arc<dyn TrustEvaluator>);

impl TrustHook {
    /// Wrap an evaluator
    pub fn new(evaluator: impl TrustEvaluator) -> Self {
        Self(Arc::new(evaluator))
    }

    #[inline]
    fn should_trust(&self, peer: &PeerTrust) -> bool {
        self.0.should_trust(peer)
    }
}

impl fmt::Debug for TrustHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TrustHook(..)")
    }
}

/// TLS protocol version bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

/// TLS options handed to the transport
///
/// Cipher suites and version bounds are opaque to the engine; it only checks
/// that they are consistent. The trust settings drive [`evaluate_trust`].
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Enabled cipher suites (empty: transport default)
    pub ciphers: Vec<String>,
    /// Minimum protocol version
    pub min_version: Option<TlsVersion>,
    /// Maximum protocol version
    pub max_version: Option<TlsVersion>,
    /// Consult the hook even when default evaluation succeeded
    pub strict_trust: bool,
    /// Caller trust override
    pub trust_hook: Option<TrustHook>,
}

impl TlsOptions {
    /// Check the options for consistency
    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_version, self.max_version)
            && min > max
        {
            return Err(Error::Config("TLS min version above max version"));
        }
        if self.ciphers.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::Config("empty cipher suite name"));
        }
        Ok(())
    }
}

/// Decide whether to accept the peer
///
/// - strict checking: the hook has the final word; without one the default
///   decision stands
/// - otherwise: a chain accepted by default passes, a rejected one is handed
///   to the hook; without a hook it stays rejected
pub fn evaluate_trust(options: &TlsOptions, peer: &PeerTrust) -> Result<()> {
    let trusted = match (&options.trust_hook, options.strict_trust) {
        (Some(hook), true) => hook.should_trust(peer),
        (Some(hook), false) => peer.default_trusted || hook.should_trust(peer),
        (None, _) => peer.default_trusted,
    };

    if trusted {
        Ok(())
    } else if options.trust_hook.is_some() {
        Err(Error::Trust("rejected by trust hook"))
    } else {
        Err(Error::Trust("peer certificate not trusted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn with_hook(strict: bool, answer: bool) -> (TlsOptions, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let options = TlsOptions {
            strict_trust: strict,
            trust_hook: Some(TrustHook::new(move |_: &PeerTrust| {
                counter.fetch_add(1, Ordering::SeqCst);
                answer
            })),
            ..Default::default()
        };
        (options, calls)
    }

    #[test]
    fn test_no_hook_uses_default() {
        let options = TlsOptions::default();
        assert!(evaluate_trust(&options, &PeerTrust::new(true)).is_ok());
        assert!(matches!(
            evaluate_trust(&options, &PeerTrust::new(false)),
            Err(Error::Trust(_))
        ));
    }

    #[test]
    fn test_hook_overrides_default_failure() {
        let (options, calls) = with_hook(false, true);
        assert!(evaluate_trust(&options, &PeerTrust::new(false)).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Default success never reaches the hook
        assert!(evaluate_trust(&options, &PeerTrust::new(true)).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_rejection_is_fatal() {
        let (options, _) = with_hook(false, false);
        let err = evaluate_trust(&options, &PeerTrust::new(false)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Trust);
    }

    #[test]
    fn test_strict_consults_hook_always() {
        let (options, calls) = with_hook(true, false);
        assert!(evaluate_trust(&options, &PeerTrust::new(true)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_sees_peer_details() {
        let options = TlsOptions {
            trust_hook: Some(TrustHook::new(|peer: &PeerTrust| {
                peer.server_name.as_deref() == Some("example.com")
            })),
            ..Default::default()
        };
        let peer = PeerTrust {
            server_name: Some("example.com".into()),
            ..Default::default()
        };
        assert!(evaluate_trust(&options, &peer).is_ok());
    }

    #[test]
    fn test_validate_versions() {
        let mut options = TlsOptions {
            min_version: Some(TlsVersion::Tls12),
            max_version: Some(TlsVersion::Tls13),
            ..Default::default()
        };
        assert!(options.validate().is_ok());
        options.min_version = Some(TlsVersion::Tls13);
        options.max_version = Some(TlsVersion::Tls12);
        assert!(matches!(options.validate(), Err(Error::Config(_))));
    }
}
