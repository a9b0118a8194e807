use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock as StdRwLock,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures_util::{stream::FuturesUnordered, StreamExt};
use tokio::{
    sync::mpsc,
    time::{interval, sleep},
};
use tracing::{debug, error, warn};

use crate::{
    gateway::frames::{OutboundEnvelope, SocketMessage},
    services, utils, Result,
};

/// Local state of one socket connection. Created on a successful
/// handshake, destroyed on disconnect; a session lives on exactly one
/// instance.
pub struct Session {
    pub socket_id: String,
    pub user_id: String,
    pub username: String,
    pub device_id: Option<String>,

    sender: mpsc::UnboundedSender<SocketMessage>,
    joined_rooms: StdRwLock<HashSet<String>>,
    last_heartbeat: AtomicU64,
}

impl Session {
    pub fn new(
        user_id: String,
        username: String,
        device_id: Option<String>,
        sender: mpsc::UnboundedSender<SocketMessage>,
    ) -> Self {
        Self {
            socket_id: utils::random_string(16),
            user_id,
            username,
            device_id,
            sender,
            joined_rooms: StdRwLock::new(HashSet::new()),
            last_heartbeat: AtomicU64::new(utils::millis_since_unix_epoch()),
        }
    }

    /// Queues a frame for delivery. A closed socket drops the frame,
    /// which is fine: the disconnect path is already running.
    pub fn send(&self, frame: OutboundEnvelope) {
        let _ = self.sender.send(SocketMessage::Frame(frame));
    }

    pub fn close(&self) {
        let _ = self.sender.send(SocketMessage::Close);
    }

    pub fn join_room(&self, room_id: &str) {
        self.joined_rooms
            .write()
            .expect("joined_rooms poisoned")
            .insert(room_id.to_owned());
    }

    pub fn leave_room(&self, room_id: &str) {
        self.joined_rooms
            .write()
            .expect("joined_rooms poisoned")
            .remove(room_id);
    }

    pub fn in_room(&self, room_id: &str) -> bool {
        self.joined_rooms
            .read()
            .expect("joined_rooms poisoned")
            .contains(room_id)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.joined_rooms
            .read()
            .expect("joined_rooms poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn touch(&self) {
        self.last_heartbeat
            .store(utils::millis_since_unix_epoch(), Ordering::Relaxed);
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }
}

struct GraceTimer {
    user_id: String,
    username: String,
}

pub struct Service {
    sockets: DashMap<String, Arc<Session>>,
    user_sockets: DashMap<String, HashSet<String>>,
    /// Users whose last local socket disconnected and whose grace timer
    /// has not fired or been cancelled yet.
    pending_grace: DashMap<String, ()>,

    timer_sender: mpsc::UnboundedSender<GraceTimer>,
}

impl Service {
    /// Builds the service and starts the grace timer task.
    pub fn build() -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let service = Self {
            sockets: DashMap::new(),
            user_sockets: DashMap::new(),
            pending_grace: DashMap::new(),
            timer_sender: sender,
        };

        service.grace_maintain(receiver);

        Ok(service)
    }

    pub fn register(&self, session: Arc<Session>) {
        self.pending_grace.remove(&session.user_id);
        self.user_sockets
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.socket_id.clone());
        self.sockets.insert(session.socket_id.clone(), session);
    }

    /// Removes the session and, if it was the user's last local socket,
    /// arms the disconnect grace: a local timer plus the distributed
    /// marker that guards against two instances racing the same user.
    pub async fn unregister(&self, socket_id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sockets.remove(socket_id)?;

        let last_local = {
            let mut entry = self
                .user_sockets
                .entry(session.user_id.clone())
                .or_default();
            entry.remove(socket_id);
            entry.is_empty()
        };
        if last_local {
            self.user_sockets.remove(&session.user_id);

            let grace = services().globals.reconnect_grace();
            if let Err(error) = services()
                .presence
                .start_disconnect_grace(&session.user_id, grace)
                .await
            {
                warn!(%error, user_id = session.user_id, "Could not set grace marker");
            }

            self.pending_grace.insert(session.user_id.clone(), ());
            let _ = self.timer_sender.send(GraceTimer {
                user_id: session.user_id.clone(),
                username: session.username.clone(),
            });
        }

        Some(session)
    }

    /// Cancels a pending local grace timer. Called on local reconnects
    /// and when another instance announces the user as online.
    pub fn cancel_grace(&self, user_id: &str) -> bool {
        self.pending_grace.remove(user_id).is_some()
    }

    pub fn session(&self, socket_id: &str) -> Option<Arc<Session>> {
        self.sockets.get(socket_id).map(|s| Arc::clone(&s))
    }

    pub fn sessions_of(&self, user_id: &str) -> Vec<Arc<Session>> {
        let Some(ids) = self.user_sockets.get(user_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.sockets.get(id).map(|s| Arc::clone(&s)))
            .collect()
    }

    pub fn has_local_sockets(&self, user_id: &str) -> bool {
        self.user_sockets
            .get(user_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn emit_to_user(&self, user_id: &str, frame: &OutboundEnvelope) {
        for session in self.sessions_of(user_id) {
            session.send(frame.clone());
        }
    }

    pub fn emit_to_room(&self, room_id: &str, frame: &OutboundEnvelope) {
        for entry in self.sockets.iter() {
            if entry.value().in_room(room_id) {
                entry.value().send(frame.clone());
            }
        }
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn local_user_count(&self) -> usize {
        self.user_sockets.len()
    }

    /// Spawns the task owning the grace timers. A timer that fires checks
    /// the local pending flag first and then claims the distributed
    /// marker; only the instance that wins the claim runs the offline
    /// transition.
    fn grace_maintain(&self, mut timer_receiver: mpsc::UnboundedReceiver<GraceTimer>) {
        tokio::spawn(async move {
            let mut timers = FuturesUnordered::new();

            loop {
                tokio::select! {
                    Some(timer) = timers.next() => {
                        if let Err(error) = handle_grace_expiry(&timer).await {
                            error!(%error, user_id = timer.user_id, "Offline transition failed");
                        }
                    }
                    timer = timer_receiver.recv() => {
                        let Some(timer) = timer else { return; };
                        let grace = services().globals.reconnect_grace();
                        timers.push(create_grace_timer(grace, timer));
                    }
                }
            }
        });
    }

    /// Closes sockets that have not produced any frame for twice the
    /// presence idle timeout. Runs on the cleanup cadence.
    pub fn start_zombie_sweep_task(&self) {
        let timer_interval =
            Duration::from_secs(services().globals.config.cleanup_second_interval as u64);

        tokio::spawn(async move {
            let mut i = interval(timer_interval);

            loop {
                i.tick().await;

                let cutoff = utils::millis_since_unix_epoch()
                    .saturating_sub(2 * services().globals.presence_idle_timeout_ms());

                for entry in services().sessions.sockets.iter() {
                    if entry.value().last_heartbeat() < cutoff {
                        debug!(
                            socket_id = entry.value().socket_id,
                            user_id = entry.value().user_id,
                            "Closing zombie socket"
                        );
                        entry.value().close();
                    }
                }
            }
        });
    }
}

async fn create_grace_timer(duration: Duration, timer: GraceTimer) -> GraceTimer {
    sleep(duration).await;

    timer
}

async fn handle_grace_expiry(timer: &GraceTimer) -> Result<()> {
    let sessions = &services().sessions;

    if !sessions.cancel_grace(&timer.user_id) {
        // Already cancelled by a reconnect here or elsewhere
        return Ok(());
    }

    if sessions.has_local_sockets(&timer.user_id) {
        return Ok(());
    }

    // The marker is deleted on any reconnect anywhere; claiming it decides
    // which instance offlines the user
    if !services()
        .presence
        .cancel_disconnect_grace(&timer.user_id)
        .await?
    {
        return Ok(());
    }

    debug!(user_id = timer.user_id, "Grace expired, going offline");

    let rooms = services().rooms.user_rooms(&timer.user_id).await?;

    services().presence.set_offline(&timer.user_id).await?;
    services().typing.remove_from_all_rooms(&timer.user_id).await?;

    for room_id in rooms {
        if let Err(error) = services()
            .rooms
            .remove_user_from_room(&timer.user_id, &room_id, &timer.username)
            .await
        {
            warn!(%error, room_id, "Could not announce user:left during offline transition");
        }
    }

    Ok(())
}
