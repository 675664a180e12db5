//! Privileged presentation-controller binding.
//!
//! The wire protocol behind this capability is a pre-generated RPC stub
//! and lives outside this crate; what lives here is the policy it
//! enforces: only one client process may hold the controller at a time, a
//! grant is only handed out for a fullscreen surface, and it is dropped on
//! explicit release, on client disconnect, and when the surface leaves
//! fullscreen.
//!
//! The manager is a plain owned value. Tie its lifetime to the session
//! object that exposes the protocol; there is deliberately no process-wide
//! instance.

use tracing::{debug, warn};

/// Identifier of a connected client, assigned by the protocol stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// Identifier of a client surface, assigned by the protocol stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// The active holder of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerGrant {
    /// The holding client.
    pub client: ClientId,
    /// The fullscreen surface the grant is tied to.
    pub surface: SurfaceId,
}

/// Errors of [`ControllerManager::grab`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GrabError {
    /// Only fullscreen surfaces may take the controller.
    #[error("the surface is not fullscreen")]
    NotFullscreen,
}

/// Policy state of the privileged controller binding.
#[derive(Debug, Default)]
pub struct ControllerManager {
    active: Option<ControllerGrant>,
}

impl ControllerManager {
    /// A manager with no active grant.
    pub fn new() -> ControllerManager {
        Default::default()
    }

    /// The current holder, if any.
    pub fn active(&self) -> Option<ControllerGrant> {
        self.active
    }

    fn deactivate(&mut self) {
        if let Some(grant) = self.active.take() {
            debug!(client = ?grant.client, surface = ?grant.surface, "Controller grant dropped");
        }
    }

    /// Let `client` take the controller for `surface`.
    ///
    /// Refused unless the surface is fullscreen; a refused request also
    /// drops any current grant. A successful request replaces the previous
    /// holder.
    pub fn grab(
        &mut self,
        client: ClientId,
        surface: SurfaceId,
        fullscreen: bool,
    ) -> Result<(), GrabError> {
        if !fullscreen {
            warn!(
                ?client,
                ?surface,
                "Refused controller request from a non-fullscreen surface"
            );
            self.deactivate();
            return Err(GrabError::NotFullscreen);
        }

        self.active = Some(ControllerGrant { client, surface });
        debug!(?client, ?surface, "Controller granted");
        Ok(())
    }

    /// Explicit release by `client`. Ignored unless it is the holder.
    pub fn release(&mut self, client: ClientId) {
        if self.active.is_some_and(|grant| grant.client == client) {
            self.deactivate();
        }
    }

    /// Drop the grant held by a client whose connection went away.
    pub fn client_disconnected(&mut self, client: ClientId) {
        if self.active.is_some_and(|grant| grant.client == client) {
            self.deactivate();
        }
    }

    /// Drop the grant when its surface stops being fullscreen.
    pub fn surface_lost_fullscreen(&mut self, surface: SurfaceId) {
        if self.active.is_some_and(|grant| grant.surface == surface) {
            self.deactivate();
        }
    }
}
