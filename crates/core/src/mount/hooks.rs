use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::Mount;
use crate::protocol::RtspRequest;

/// Decides whether Basic credentials may publish or subscribe.
///
/// Implementations may attach a [`RequestContext`](crate::protocol::request::RequestContext)
/// to the request; a subscriber session created from it keeps that context.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str, request: &mut RtspRequest)
    -> bool;
}

/// Decides whether a path may be published (checked on ANNOUNCE).
#[async_trait]
pub trait MountCheck: Send + Sync {
    async fn allow(&self, request: &RtspRequest) -> bool;
}

/// Notifications about subscriber churn on a mount.
pub trait MountEvents: Send + Sync {
    /// The last playing subscriber left the mount.
    fn mount_now_empty(&self, _mount: &Mount) {}

    /// A subscriber session on the mount was torn down by TEARDOWN.
    fn client_close(&self, _mount: &Mount) {}
}

/// Optional callbacks consulted by the protocol adapters and mounts.
#[derive(Clone, Default)]
pub struct Hooks {
    pub authentication: Option<Arc<dyn Authenticator>>,
    pub check_mount: Option<Arc<dyn MountCheck>>,
    pub events: Option<Arc<dyn MountEvents>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("authentication", &self.authentication.is_some())
            .field("check_mount", &self.check_mount.is_some())
            .field("events", &self.events.is_some())
            .finish()
    }
}
