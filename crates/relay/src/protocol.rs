// Protocol version negotiation and N-1 support.
//
// Clients name the protocol version they speak in their hello frame. The
// server answers unsupported versions with an UPGRADE_REQUIRED error frame
// and closes the connection. N-1 support is kept for at least one release.

use bookclub_common::protocol::ws::{CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};

use crate::error::SyncError;

/// The current (latest) protocol version.
pub const CURRENT_VERSION: &str = CURRENT_PROTOCOL_VERSION;

/// Returns true if the given protocol version string is supported.
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Returns the list of supported protocol versions (newest first).
pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_PROTOCOL_VERSIONS
}

/// Validates a client-supplied protocol version. A hello without a version
/// is treated as the current one.
pub fn require_supported(version: Option<&str>) -> Result<(), SyncError> {
    match version {
        None => Ok(()),
        Some(version) if is_supported(version) => Ok(()),
        Some(version) => Err(SyncError::UnsupportedProtocol(format!(
            "{version} (supported: {})",
            SUPPORTED_PROTOCOL_VERSIONS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use bookclub_common::protocol::ws::ServerFrame;

    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn current_version_is_supported() {
        assert!(is_supported(CURRENT_VERSION));
        assert!(require_supported(Some(CURRENT_VERSION)).is_ok());
        assert!(require_supported(None).is_ok());
    }

    #[test]
    fn unknown_version_is_not_supported() {
        assert!(!is_supported("bookclub-rooms.v99"));
        assert!(!is_supported(""));
        assert!(!is_supported("some-other-protocol"));
    }

    #[test]
    fn previous_version_is_supported_for_n_minus_one_compatibility() {
        assert!(is_supported("bookclub-rooms.v0"));
        assert!(require_supported(Some("bookclub-rooms.v0")).is_ok());
    }

    #[test]
    fn require_supported_rejects_partial_match() {
        assert!(require_supported(Some("bookclub-rooms.v1-beta")).is_err());
        assert!(require_supported(Some("bookclub-rooms.v")).is_err());
    }

    #[test]
    fn unsupported_version_maps_to_upgrade_required_frame() {
        let error = require_supported(Some("bookclub-rooms.v99")).unwrap_err();
        assert_eq!(error.code(), ErrorCode::UpgradeRequired);

        let ServerFrame::Error { code, message, retryable, .. } = error.to_frame() else {
            panic!("expected error frame");
        };
        assert_eq!(code, "UPGRADE_REQUIRED");
        assert!(!retryable);
        assert!(message.contains(CURRENT_VERSION));
    }

    #[test]
    fn compatibility_matrix_accepts_all_supported_versions_and_keeps_unique_order() {
        let versions = supported_versions();
        assert!(!versions.is_empty(), "supported version list must not be empty");
        assert_eq!(
            versions[0], CURRENT_VERSION,
            "the current version must remain the first (N) entry",
        );

        let mut seen = HashSet::new();
        for version in versions {
            assert!(seen.insert(*version), "duplicate supported version entry: {version}");
            assert!(
                require_supported(Some(version)).is_ok(),
                "supported version should be accepted: {version}",
            );
        }
    }
}
