//! Reverse name resolution for hostname-form account entries.
//!
//! Lookups run on the resolver's own task pool and are bounded in time;
//! a slow PTR zone must not stall authentication indefinitely.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

static RESOLVER: Lazy<Option<TokioAsyncResolver>> = Lazy::new(|| {
    match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => Some(resolver),
        Err(e) => {
            warn!(error = %e, "system resolver unavailable, reverse lookups disabled");
            None
        }
    }
});

/// Resolve the client address to a hostname. `None` means the lookup
/// failed or timed out; callers record that and do not retry within the
/// same authentication attempt.
pub async fn reverse_lookup(addr: IpAddr) -> Option<String> {
    let resolver = RESOLVER.as_ref()?;

    let lookup = tokio::time::timeout(LOOKUP_TIMEOUT, resolver.reverse_lookup(addr)).await;
    match lookup {
        Ok(Ok(names)) => {
            let name = names.iter().next()?;
            let mut hostname = name.to_string();
            if hostname.ends_with('.') {
                hostname.pop();
            }
            debug!(addr = %addr, hostname = %hostname, "reverse lookup succeeded");
            Some(hostname)
        }
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "reverse lookup failed");
            None
        }
        Err(_) => {
            warn!(addr = %addr, "reverse lookup timed out");
            None
        }
    }
}
