//! Membership join protocol and ring-neighbour negotiation.
//!
//! A newcomer hails the bootstrap, which answers with a member to knock on
//! (or the sentinel when nobody has joined yet). Knocks are funnelled to the
//! frontier, the member with the highest id, which grants `max + 1` together
//! with its membership table. The newcomer then announces itself with an
//! Entered broadcast and registers with the bootstrap.

use std::time::Duration;

use fractal_protocol::{Direction, Message, NodeInfo, NodeRole, SystemInfo};
use tokio::sync::MutexGuard;

use crate::error::{Error, Result};
use crate::membership::JoinState;
use crate::worker::WorkerNode;

/// Pause before re-hailing after the bootstrap could not be reached.
const HAIL_RETRY_PAUSE: Duration = Duration::from_millis(200);

impl WorkerNode {
    /// Join the system through the bootstrap.
    ///
    /// Each attempt sends one Hail and waits for the join to complete, bounded
    /// by the configured per-attempt timeout. Returns our identity once we are
    /// a member.
    pub async fn join(&self) -> Result<NodeInfo> {
        let attempts = self.settings.join.attempts.max(1);
        let per_attempt = self.settings.join.timeout;
        let mut state = self.joined.subscribe();

        for attempt in 1..=attempts {
            {
                let mut entrance = self.entrance.lock().await;
                if *entrance == JoinState::Member {
                    return Ok(self.table.me().await);
                }
                self.set_join_state(&mut entrance, JoinState::AwaitingContact);
            }

            let me = self.table.me().await;
            let hail = self.factory.hail(&me, &self.bootstrap);
            if !self.outbox.send(&self.bootstrap, &hail).await {
                self.log.error(format!(
                    "hail {attempt}/{attempts} could not reach bootstrap {}",
                    self.bootstrap
                ));
                tokio::time::sleep(HAIL_RETRY_PAUSE).await;
                continue;
            }

            let member = state.wait_for(|s| *s == JoinState::Member);
            let joined = match per_attempt {
                Some(limit) => matches!(tokio::time::timeout(limit, member).await, Ok(Ok(_))),
                None => member.await.is_ok(),
            };
            if joined {
                let me = self.table.me().await;
                self.log.activity(format!("joined as {me}"));
                return Ok(me);
            }
            self.log
                .error(format!("join attempt {attempt}/{attempts} timed out"));
        }

        let mut entrance = self.entrance.lock().await;
        if *entrance == JoinState::Member {
            return Ok(self.table.me().await);
        }
        self.set_join_state(&mut entrance, JoinState::Unjoined);
        Err(Error::JoinTimeout {
            attempts,
            timeout: per_attempt.unwrap_or(Duration::ZERO),
        })
    }

    pub(crate) fn set_join_state(&self, entrance: &mut MutexGuard<'_, JoinState>, state: JoinState) {
        **entrance = state;
        self.joined.send_replace(state);
    }

    pub(crate) async fn on_contact(&self, contact: &NodeInfo) {
        let mut entrance = self.entrance.lock().await;
        if *entrance != JoinState::AwaitingContact {
            self.log
                .error(format!("Contact {contact} discarded in state {:?}", *entrance));
            return;
        }

        if contact.is_unassigned() {
            // Nobody has joined yet: we are node 0.
            let me = self.table.lock().await.assign_id(0);
            self.log.activity(format!("first node in the system, now {me}"));
            self.register_with_bootstrap(&me).await;
            self.set_join_state(&mut entrance, JoinState::Member);
            return;
        }

        let me = self.table.me().await;
        self.set_join_state(&mut entrance, JoinState::AwaitingWelcome);
        let knock = self.factory.system_knock(&me, contact);
        if !self.outbox.send(contact, &knock).await {
            self.log.error(format!("knock on {contact} failed"));
        }
    }

    /// Grant an id or funnel the knock toward the frontier.
    ///
    /// The table stays locked from reading the frontier until the reply has
    /// been sent; the granted id is recorded before the lock is released.
    pub(crate) async fn on_system_knock(&self, msg: &Message) {
        let mut worker = self.table.lock().await;
        if !worker.is_member() {
            self.log
                .error(format!("knock from {} before we have an id", msg.sender));
            return;
        }

        let frontier = worker.frontier_id();
        if frontier != worker.id() {
            let Some(target) = worker.system_info.get(&frontier).cloned() else {
                self.log.error(format!("frontier #{frontier} missing from table"));
                return;
            };
            let relayed = msg.make_me_a_sender(&*worker);
            self.log.activity(format!(
                "relaying knock from {} to frontier {target}",
                msg.sender
            ));
            if !self.outbox.send(&target, &relayed).await {
                self.log
                    .error(format!("relay of {msg} to {target} failed"));
            }
            return;
        }

        let assigned = frontier + 1;
        let snapshot = worker.system_info.clone();
        let welcome = self
            .factory
            .welcome(&worker.node, &msg.sender, assigned, snapshot);
        if let Err(existing) = worker.admit(msg.sender.with_id(assigned)) {
            self.log
                .error(format!("id {assigned} already held by {existing}"));
            return;
        }

        if self.outbox.send(&msg.sender, &welcome).await {
            self.log
                .activity(format!("granted #{assigned} to {}", msg.sender));
        } else {
            worker.evict(assigned);
            self.log.error(format!(
                "Welcome to {} failed; #{assigned} withdrawn",
                msg.sender
            ));
        }
    }

    pub(crate) async fn on_welcome(&self, msg: &Message, assigned_id: i64, snapshot: SystemInfo) {
        let mut entrance = self.entrance.lock().await;
        if !matches!(
            *entrance,
            JoinState::AwaitingContact | JoinState::AwaitingWelcome
        ) {
            self.log.error(format!(
                "Welcome #{assigned_id} from {} discarded in state {:?}",
                msg.sender, *entrance
            ));
            drop(entrance);
            self.decline_grant(msg, assigned_id).await;
            return;
        }

        let (me, peers) = {
            let mut worker = self.table.lock().await;
            let me = worker.assign_id(assigned_id);
            worker.merge(snapshot);
            (me, worker.peers())
        };
        self.log
            .activity(format!("welcomed by {} as {me}", msg.sender));

        let entered = self.factory.entered(&me);
        if !self.outbox.broadcast(&peers, &entered).await {
            self.log
                .error(format!("Entered for {me} did not reach every peer"));
        }
        self.register_with_bootstrap(&me).await;
        self.set_join_state(&mut entrance, JoinState::Member);
        drop(entrance);

        self.connect_ring(&me).await;
    }

    /// The granter pre-recorded us under `assigned_id`; tell it to drop that
    /// entry unless the id is the one we actually hold.
    async fn decline_grant(&self, msg: &Message, assigned_id: i64) {
        let me = self.table.me().await;
        if me.id == assigned_id {
            return;
        }
        let decline = self.factory.decline_grant(&me, &msg.sender, assigned_id);
        if self.outbox.send(&msg.sender, &decline).await {
            self.log
                .activity(format!("handed #{assigned_id} back to {}", msg.sender));
        } else {
            self.log
                .error(format!("could not hand #{assigned_id} back to {}", msg.sender));
        }
    }

    pub(crate) async fn on_entered(&self, node: &NodeInfo) {
        let mut worker = self.table.lock().await;
        match worker.admit(node.clone()) {
            Ok(()) => self.log.activity(format!("{node} entered")),
            // The frontier records a newcomer when granting its id.
            Err(existing) if existing == *node => self
                .log
                .activity(format!("duplicate Entered for #{}: already known", node.id)),
            Err(existing) => self.log.error(format!(
                "duplicate Entered for #{}: {node} rejected, keeping {existing}",
                node.id
            )),
        }
    }

    async fn register_with_bootstrap(&self, me: &NodeInfo) {
        let join = self.factory.join(me, &self.bootstrap);
        if !self.outbox.send(&self.bootstrap, &join).await {
            self.log
                .error(format!("Join for {me} did not reach bootstrap"));
        }
    }

    /// Ask our predecessor by id to become our PREV neighbour.
    async fn connect_ring(&self, me: &NodeInfo) {
        let Some(prev) = self.table.get(me.id - 1).await else {
            return;
        };
        let request = self
            .factory
            .connection_request(me, &prev, Direction::Prev);
        if !self.outbox.send(&prev, &request).await {
            self.log
                .error(format!("ring request to {prev} failed"));
        }
    }

    /// The sender asks us to be its neighbour in `direction`, which puts it
    /// in our opposite slot.
    pub(crate) async fn on_connection_request(&self, msg: &Message, direction: Direction) {
        let me = self.table.me().await;
        let slot = direction.opposite();
        let accepted = {
            let mut ring = self.ring.lock().await;
            let accepted = ring.can_link(slot, &msg.sender);
            if accepted {
                ring.set(slot, msg.sender.clone());
            }
            accepted
        };

        let response = self
            .factory
            .connection_response(&me, &msg.sender, accepted, direction);
        if !self.outbox.send(&msg.sender, &response).await {
            self.log
                .error(format!("ring response to {} failed", msg.sender));
        }
    }

    pub(crate) async fn on_connection_response(
        &self,
        msg: &Message,
        accepted: bool,
        direction: Direction,
    ) {
        if !accepted {
            self.log
                .activity(format!("{} refused to be our {direction:?}", msg.sender));
            return;
        }
        self.ring.lock().await.set(direction, msg.sender.clone());
        self.log
            .activity(format!("{} is now our {direction:?}", msg.sender));
    }
}
