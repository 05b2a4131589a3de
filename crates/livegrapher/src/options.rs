use std::net::{IpAddr, Ipv4Addr};

/// Tunables for [`crate::Engine::new`]. Every field has a documented
/// default; there is no config-file format — construct this in-process.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Per-client outbound queue bound in bytes. `0` means unbounded.
    /// Appends past this bound are dropped at frame boundaries.
    pub max_queue_bytes_per_client: usize,
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    /// Backlog passed to `listen(2)`.
    pub listen_backlog: u32,
    /// Whether accepted sockets get `TCP_NODELAY`.
    pub tcp_nodelay: bool,
    /// Encode dataset ids with the historical, arithmetically wrong `0x2F`
    /// mask instead of the correct `0x3F`, for interop with a pre-existing
    /// client built against the buggy host. Decoding is unaffected: the
    /// wire layout never changes, only which bits a buggy encoder set.
    pub legacy_id_mask_compat: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_queue_bytes_per_client: 1024 * 1024,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_backlog: 16,
            tcp_nodelay: true,
            legacy_id_mask_compat: false,
        }
    }
}

impl EngineOptions {
    pub(crate) fn id_mask(&self) -> u8 {
        if self.legacy_id_mask_compat { crate::protocol::LEGACY_ID_MASK } else { crate::protocol::ID_MASK }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = EngineOptions::default();
        assert_eq!(opts.max_queue_bytes_per_client, 1024 * 1024);
        assert_eq!(opts.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(opts.listen_backlog, 16);
        assert!(opts.tcp_nodelay);
        assert!(!opts.legacy_id_mask_compat);
    }

    #[test]
    fn id_mask_selection() {
        let mut opts = EngineOptions::default();
        assert_eq!(opts.id_mask(), crate::protocol::ID_MASK);
        opts.legacy_id_mask_compat = true;
        assert_eq!(opts.id_mask(), crate::protocol::LEGACY_ID_MASK);
    }
}
