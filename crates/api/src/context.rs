use assay_core::OwnerId;

/// Identity of the caller for a request.
///
/// Injected by [`crate::middleware::caller_middleware`]; every `/jobs` route
/// reads it to scope submissions and status reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CallerContext {
    owner_id: OwnerId,
}

impl CallerContext {
    pub fn new(owner_id: OwnerId) -> Self {
        Self { owner_id }
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }
}
