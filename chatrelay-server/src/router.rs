//! Message routing
//!
//! Decides who receives what. Routing runs on whichever connection task
//! decoded the triggering message, so everything here is safe to call from
//! many tasks at once. Deciding ([`Router::plan`]) is separated from
//! delivering ([`Router::dispatch`]) so fan-out rules can be tested without
//! sockets.
//!
//! Membership changes (join, departure, shutdown) hold an internal lock
//! exclusively across the registry mutation and the enqueueing of its
//! announcements; routing holds it shared from snapshot to enqueue. Queues
//! are FIFO, so the last roster any session receives always matches the
//! current membership, and a broadcast never targets a session that is
//! being removed.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use chatrelay_protocol::{ApplicationMessage, Identity, Timestamp};

use crate::observability::Metrics;
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::Session;

/// Current wall-clock time, second resolution
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Non-fatal routing outcome reported back to the sender's task
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("user {0} not found")]
    TargetNotFound(Identity),

    #[error("{0} messages are not accepted from clients")]
    Unsupported(&'static str),
}

/// Messages to enqueue, in order
#[derive(Debug, Default)]
pub struct Plan {
    pub sends: Vec<(Arc<Session>, ApplicationMessage)>,
    pub rejected: Option<RouteError>,
}

impl Plan {
    fn push(&mut self, target: &Arc<Session>, message: &ApplicationMessage) {
        self.sends.push((Arc::clone(target), message.clone()));
    }
}

/// Result of dispatching a [`Plan`]
#[derive(Debug, Default)]
pub struct Delivery {
    /// Messages successfully queued
    pub delivered: usize,
    /// Targets whose queue refused a message; each appears once
    pub failed: Vec<Arc<Session>>,
    pub rejected: Option<RouteError>,
}

/// Fan-out engine over a [`SessionRegistry`]
pub struct Router {
    registry: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
    membership: RwLock<()>,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            metrics,
            membership: RwLock::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    // ==================== Inbound Messages ====================

    /// Decide the deliveries for a message received from `sender`
    ///
    /// - Chat goes to every registered session, the sender included.
    /// - Direct goes to the target and is echoed to the sender (once if they
    ///   are the same session); an offline target yields a notice to the
    ///   sender only.
    /// - Anything else is rejected without deliveries.
    pub fn plan(&self, sender: &Arc<Session>, message: ApplicationMessage, now: Timestamp) -> Plan {
        let mut plan = Plan::default();

        let message = message.stamped(sender.identity(), now);
        match &message {
            ApplicationMessage::Chat { .. } => {
                for (_, target) in self.registry.snapshot_all() {
                    plan.push(&target, &message);
                }
            }
            ApplicationMessage::Direct {
                target_identity, ..
            } => match self.registry.lookup(target_identity) {
                Some(target) => {
                    plan.push(&target, &message);
                    if target.id() != sender.id() {
                        plan.push(sender, &message);
                    }
                }
                None => {
                    let notice = ApplicationMessage::system_notice(
                        format!("User {} not found", target_identity),
                        now,
                    );
                    plan.push(sender, &notice);
                    plan.rejected = Some(RouteError::TargetNotFound(target_identity.clone()));
                }
            },
            other => {
                plan.rejected = Some(RouteError::Unsupported(other.kind()));
            }
        }

        plan
    }

    /// Route a message received from `sender`
    pub fn route(&self, sender: &Arc<Session>, message: ApplicationMessage) -> Delivery {
        match &message {
            ApplicationMessage::Chat { text, .. } => {
                info!("{}: {}", sender.identity(), text);
                self.metrics.record_chat();
            }
            ApplicationMessage::Direct {
                text,
                target_identity,
                ..
            } => {
                info!("{} -> {}: {}", sender.identity(), target_identity, text);
                self.metrics.record_direct();
            }
            _ => {}
        }

        let _membership = self.membership.read();
        let plan = self.plan(sender, message, now());
        match &plan.rejected {
            Some(RouteError::TargetNotFound(target)) => {
                debug!("{} messaged offline user {}", sender.identity(), target);
            }
            Some(RouteError::Unsupported(kind)) => {
                warn!("Ignoring {} message from {}", kind, sender.identity());
            }
            None => {}
        }

        self.dispatch(plan)
    }

    /// Enqueue every send in `plan`
    ///
    /// A failing target never stops delivery to the others.
    pub fn dispatch(&self, plan: Plan) -> Delivery {
        let mut delivery = Delivery {
            rejected: plan.rejected,
            ..Default::default()
        };
        let mut failed_ids = HashSet::new();

        for (target, message) in plan.sends {
            match target.send(message) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!("Delivery to {} failed: {}", target.identity(), e);
                    if failed_ids.insert(target.id()) {
                        delivery.failed.push(target);
                    }
                }
            }
        }

        self.metrics.record_delivery_failures(delivery.failed.len());
        delivery
    }

    // ==================== Membership ====================

    /// Register `session` and announce it
    ///
    /// The joiner is greeted, everyone else is told who joined, then every
    /// session (joiner included) gets the new roster. On
    /// [`RegistryError::DuplicateIdentity`] nothing is sent and the registry
    /// is unchanged.
    pub fn join(&self, session: &Arc<Session>) -> Result<Delivery, RegistryError> {
        let _membership = self.membership.write();

        self.registry.register(Arc::clone(session))?;
        info!("{} joined from {}", session.identity(), session.remote_addr());

        let now = now();
        let mut plan = Plan::default();

        let welcome = ApplicationMessage::system_notice(
            format!("Connected to relay as {}", session.identity()),
            now,
        );
        plan.push(session, &welcome);

        let snapshot = self.registry.snapshot_all();
        let joined =
            ApplicationMessage::system_notice(format!("{} joined", session.identity()), now);
        for (_, other) in &snapshot {
            if other.id() != session.id() {
                plan.push(other, &joined);
            }
        }
        push_roster(&mut plan, &snapshot, now);

        Ok(self.dispatch(plan))
    }

    /// Unregister `session` and announce its departure
    ///
    /// Returns `None` if the session was not registered (already torn down,
    /// never joined, or the registry was closed by shutdown).
    pub fn depart(&self, session: &Session) -> Option<Delivery> {
        let _membership = self.membership.write();

        if !self.registry.unregister_session(session) {
            return None;
        }
        info!("{} left", session.identity());

        let now = now();
        let mut plan = Plan::default();

        let snapshot = self.registry.snapshot_all();
        let left = ApplicationMessage::system_notice(format!("{} left", session.identity()), now);
        for (_, other) in &snapshot {
            plan.push(other, &left);
        }
        push_roster(&mut plan, &snapshot, now);

        Some(self.dispatch(plan))
    }

    /// Close the registry, send `notice` to every session and ask each
    /// writer to flush and stop
    ///
    /// Returns the sessions that were registered so the caller can wait for
    /// them and then force them closed.
    pub fn close_all(&self, notice: &str) -> Vec<Arc<Session>> {
        let _membership = self.membership.write();

        let sessions = self.registry.close();
        let message = ApplicationMessage::system_notice(notice, now());

        for session in &sessions {
            if let Err(e) = session.send(message.clone()) {
                debug!("Shutdown notice to {} not queued: {}", session.identity(), e);
            }
            if let Err(e) = session.finish() {
                debug!("Shutdown flush for {} not queued: {}", session.identity(), e);
            }
        }

        sessions
    }
}

/// Queue a roster of `snapshot` for every session in it
fn push_roster(plan: &mut Plan, snapshot: &[(Identity, Arc<Session>)], now: Timestamp) {
    let mut identities: Vec<Identity> = snapshot.iter().map(|(id, _)| id.clone()).collect();
    identities.sort();

    let roster = ApplicationMessage::roster(identities, now);
    for (_, session) in snapshot {
        plan.push(session, &roster);
    }
}
