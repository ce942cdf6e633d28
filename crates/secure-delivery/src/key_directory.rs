use crate::transport::TransportResult;
use crate::{PreKeyBundle, SealedSenderAccess, ServiceAddress};

/// Server-side directory of published pre-key bundles.
pub trait KeyDirectory: Send + Sync {
    /// Fetches bundles for one device, or for every device when `device_id`
    /// is `None`. Returns `TransportError::Unauthorized` when the supplied
    /// sealed-sender access is not accepted; callers retry unsealed.
    /// `TransportError::Unregistered` means the account no longer exists.
    fn fetch_pre_key_bundles(
        &self,
        address: &ServiceAddress,
        device_id: Option<u32>,
        access: Option<&SealedSenderAccess>,
    ) -> TransportResult<Vec<PreKeyBundle>>;
}
