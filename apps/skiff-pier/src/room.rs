use std::collections::HashMap;

use metrics::counter;
use skiff_protocol::{ClientFrame, Role, RoomConfig, ServerFrame};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Close code used when a reconnect with the same cid evicts an older
/// socket.
pub const CLOSE_REPLACED_CODE: u16 = 1000;
pub const CLOSE_REPLACED_REASON: &str = "replaced";

/// Traffic the actor pushes towards one socket. The websocket writer
/// task drains these in order; `Close` terminates the writer.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    Close { code: u16, reason: &'static str },
}

/// Intents enqueued by socket tasks. The actor is the only place room
/// state is touched, so processing these in arrival order is the whole
/// concurrency story.
#[derive(Debug)]
pub enum RoomCommand {
    Connect {
        cid: String,
        conn_id: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Frame {
        cid: String,
        conn_id: u64,
        frame: ClientFrame,
    },
    Disconnect {
        cid: String,
        conn_id: u64,
    },
}

#[derive(Clone)]
pub struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// False when the actor has already exited; callers re-obtain a
    /// fresh room through the registry in that case.
    pub fn send(&self, command: RoomCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn spawn_room(room_id: String, config: RoomConfig) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = RoomActor {
        room_id,
        config,
        sockets: HashMap::new(),
        active_pairs: HashMap::new(),
        join_seq: 0,
    };
    tokio::spawn(actor.run(rx));
    RoomHandle { tx }
}

/// Queue state of a receiver. `Done` is terminal: a receiver that
/// finished its transfer is never promoted again in this room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Waiting,
    Active,
    Done,
}

struct Socket {
    conn_id: u64,
    role: Role,
    state: QueueState,
    joined_at: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

struct RoomActor {
    room_id: String,
    config: RoomConfig,
    /// cid → socket; at most one socket per cid by construction.
    sockets: HashMap<String, Socket>,
    /// answerer cid → offerer cid; an entry exists iff the answerer is
    /// `Active`.
    active_pairs: HashMap<String, String>,
    join_seq: u64,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        info!(room = %self.room_id, max_concurrent = self.config.max_concurrent, "room started");
        let mut seen_any = false;
        while let Some(command) = rx.recv().await {
            match command {
                RoomCommand::Connect {
                    cid,
                    conn_id,
                    outbound,
                } => {
                    seen_any = true;
                    self.handle_connect(cid, conn_id, outbound);
                }
                RoomCommand::Frame {
                    cid,
                    conn_id,
                    frame,
                } => self.handle_frame(cid, conn_id, frame),
                RoomCommand::Disconnect { cid, conn_id } => self.handle_disconnect(cid, conn_id),
            }
            if seen_any && self.sockets.is_empty() {
                break;
            }
        }
        info!(room = %self.room_id, "room ended");
    }

    fn handle_connect(
        &mut self,
        cid: String,
        conn_id: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        // One socket per cid: a reconnect gracefully replaces the older
        // socket. Its later Disconnect is recognised by conn_id and
        // ignored apart from a peers rebroadcast.
        if let Some(previous) = self.sockets.remove(&cid) {
            let _ = previous.outbound.send(Outbound::Close {
                code: CLOSE_REPLACED_CODE,
                reason: CLOSE_REPLACED_REASON,
            });
            if self.active_pairs.remove(&cid).is_some() {
                // The replacement queues from scratch, so the sender
                // must tear down the session bound to the old socket.
                self.send_to_offerer(ServerFrame::PeerLeft {
                    peer_id: cid.clone(),
                });
            }
            debug!(room = %self.room_id, %cid, "replaced existing socket");
        }

        let role = match &self.config.creator_cid {
            Some(creator) => {
                if &cid == creator {
                    Role::Offerer
                } else {
                    Role::Answerer
                }
            }
            None => {
                if self.offerer().is_some() {
                    Role::Answerer
                } else {
                    Role::Offerer
                }
            }
        };

        self.join_seq += 1;
        let _ = outbound.send(Outbound::Frame(ServerFrame::Role {
            role,
            cid: cid.clone(),
        }));
        self.sockets.insert(
            cid.clone(),
            Socket {
                conn_id,
                role,
                state: QueueState::Waiting,
                joined_at: self.join_seq,
                outbound,
            },
        );
        info!(room = %self.room_id, %cid, ?role, peers = self.sockets.len(), "socket joined");

        if role == Role::Answerer {
            self.send_wait(&cid);
        }
        self.broadcast_peers();
        self.fill_slots();
    }

    fn handle_frame(&mut self, cid: String, conn_id: u64, frame: ClientFrame) {
        let Some(origin) = self.sockets.get(&cid) else {
            return drop_frame(&self.room_id, "unknown socket");
        };
        if origin.conn_id != conn_id {
            // Frame raced in from a socket that has since been replaced.
            return drop_frame(&self.room_id, "stale socket");
        }
        let origin_role = origin.role;

        match frame {
            ClientFrame::Offer { to, sid, sdp } => {
                if origin_role == Role::Offerer && self.pair_of(&to) == Some(&cid) {
                    self.send_to(&to, ServerFrame::Offer { from: cid, sid, sdp });
                } else {
                    drop_frame(&self.room_id, "unauthorized offer");
                }
            }
            ClientFrame::Answer { to, sid, sdp } => {
                if origin_role == Role::Answerer && self.pair_of(&cid) == Some(&to) {
                    self.send_to(&to, ServerFrame::Answer { from: cid, sid, sdp });
                } else {
                    drop_frame(&self.room_id, "unauthorized answer");
                }
            }
            ClientFrame::Candidate { to, sid, candidate } => {
                let authorized = match origin_role {
                    Role::Offerer => self.pair_of(&to) == Some(&cid),
                    Role::Answerer => self.pair_of(&cid) == Some(&to),
                };
                if authorized {
                    self.send_to(
                        &to,
                        ServerFrame::Candidate {
                            from: cid,
                            sid,
                            candidate,
                        },
                    );
                } else {
                    drop_frame(&self.room_id, "unauthorized candidate");
                }
            }
            ClientFrame::TransferDone { peer_id } => {
                if origin_role != Role::Offerer {
                    return drop_frame(&self.room_id, "transfer-done from answerer");
                }
                let Some(receiver) = self.sockets.get_mut(&peer_id) else {
                    return;
                };
                if receiver.role != Role::Answerer || receiver.state == QueueState::Done {
                    // Repeats for a finished receiver are a no-op.
                    return;
                }
                receiver.state = QueueState::Done;
                self.active_pairs.remove(&peer_id);
                info!(room = %self.room_id, receiver = %peer_id, "transfer done");
                self.fill_slots();
            }
        }
    }

    fn handle_disconnect(&mut self, cid: String, conn_id: u64) {
        match self.sockets.get(&cid) {
            Some(socket) if socket.conn_id == conn_id => {}
            // Replaced or already gone; membership did not change but
            // listeners still get a peers refresh.
            _ => return self.broadcast_peers(),
        }
        let socket = self.sockets.remove(&cid).expect("socket checked above");
        info!(room = %self.room_id, %cid, role = ?socket.role, "socket left");

        match socket.role {
            Role::Answerer => {
                self.active_pairs.remove(&cid);
                self.send_to_offerer(ServerFrame::PeerLeft { peer_id: cid });
                self.fill_slots();
                // Anyone behind the departed receiver moved up.
                self.refresh_wait_positions();
            }
            Role::Offerer => {
                // Without a sender there is nothing to schedule; every
                // unfinished receiver queues again for the next one.
                self.active_pairs.clear();
                for socket in self.sockets.values_mut() {
                    if socket.state == QueueState::Active {
                        socket.state = QueueState::Waiting;
                    }
                }
                self.refresh_wait_positions();
            }
        }
        self.broadcast_peers();
    }

    /// Promote waiting receivers into free slots, oldest join first
    /// with a cid tiebreak so promotion order is deterministic.
    fn fill_slots(&mut self) {
        let Some(offerer_cid) = self.offerer().map(|(cid, _)| cid.clone()) else {
            return;
        };
        let active = self
            .sockets
            .values()
            .filter(|s| s.role == Role::Answerer && s.state == QueueState::Active)
            .count();
        let available = (self.config.max_concurrent as usize).saturating_sub(active);
        if available == 0 {
            return;
        }

        let queue = promotion_order(
            self.sockets
                .iter()
                .filter(|(_, s)| s.role == Role::Answerer && s.state == QueueState::Waiting)
                .map(|(cid, s)| (s.joined_at, cid.clone())),
        );

        let mut promoted = false;
        for cid in queue.into_iter().take(available) {
            let Some(socket) = self.sockets.get_mut(&cid) else {
                continue;
            };
            socket.state = QueueState::Active;
            self.active_pairs.insert(cid.clone(), offerer_cid.clone());
            self.send_to(&cid, ServerFrame::Start { peer_id: None });
            self.send_to_offerer(ServerFrame::Start {
                peer_id: Some(cid.clone()),
            });
            debug!(room = %self.room_id, receiver = %cid, "slot filled");
            promoted = true;
        }
        if promoted {
            self.refresh_wait_positions();
        }
    }

    fn offerer(&self) -> Option<(&String, &Socket)> {
        self.sockets.iter().find(|(_, s)| s.role == Role::Offerer)
    }

    fn pair_of(&self, answerer_cid: &str) -> Option<&String> {
        self.active_pairs.get(answerer_cid)
    }

    fn send_to(&self, cid: &str, frame: ServerFrame) {
        if let Some(socket) = self.sockets.get(cid) {
            let _ = socket.outbound.send(Outbound::Frame(frame));
        }
    }

    fn send_to_offerer(&self, frame: ServerFrame) {
        if let Some((_, socket)) = self.offerer() {
            let _ = socket.outbound.send(Outbound::Frame(frame));
        }
    }

    fn broadcast_peers(&self) {
        let frame = ServerFrame::Peers {
            count: self.sockets.len() as u32,
        };
        for socket in self.sockets.values() {
            let _ = socket.outbound.send(Outbound::Frame(frame.clone()));
        }
    }

    fn send_wait(&self, cid: &str) {
        let position = self
            .waiting_order()
            .iter()
            .position(|c| c == cid)
            .map(|idx| idx as u32 + 1);
        self.send_to(cid, ServerFrame::Wait { position });
    }

    /// Tell every queued receiver where it currently stands.
    fn refresh_wait_positions(&self) {
        for (idx, cid) in self.waiting_order().iter().enumerate() {
            self.send_to(
                cid,
                ServerFrame::Wait {
                    position: Some(idx as u32 + 1),
                },
            );
        }
    }

    fn waiting_order(&self) -> Vec<String> {
        promotion_order(
            self.sockets
                .iter()
                .filter(|(_, s)| s.role == Role::Answerer && s.state == QueueState::Waiting)
                .map(|(cid, s)| (s.joined_at, cid.clone())),
        )
    }
}

/// FIFO by join order; equal timestamps fall back to cid order so two
/// schedulers fed the same membership agree on who goes first.
fn promotion_order(waiting: impl Iterator<Item = (u64, String)>) -> Vec<String> {
    let mut queue: Vec<(u64, String)> = waiting.collect();
    queue.sort();
    queue.into_iter().map(|(_, cid)| cid).collect()
}

fn drop_frame(room_id: &str, reason: &'static str) {
    counter!("skiff_pier_frames_dropped_total").increment(1);
    debug!(room = %room_id, reason, "dropped frame");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    struct TestSocket {
        cid: String,
        conn_id: u64,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl TestSocket {
        async fn recv(&mut self) -> ServerFrame {
            let out = timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("socket channel closed");
            match out {
                Outbound::Frame(frame) => frame,
                Outbound::Close { code, reason } => {
                    panic!("expected frame, got close {code} {reason}")
                }
            }
        }

        async fn recv_close(&mut self) -> (u16, &'static str) {
            loop {
                let out = timeout(Duration::from_secs(1), self.rx.recv())
                    .await
                    .expect("timed out waiting for close")
                    .expect("socket channel closed");
                if let Outbound::Close { code, reason } = out {
                    return (code, reason);
                }
            }
        }

        /// Skip frames until one matches; panics on close.
        async fn recv_until(&mut self, pred: impl Fn(&ServerFrame) -> bool) -> ServerFrame {
            loop {
                let frame = self.recv().await;
                if pred(&frame) {
                    return frame;
                }
            }
        }

        fn assert_idle(&mut self) {
            match self.rx.try_recv() {
                Err(mpsc::error::TryRecvError::Empty) => {}
                other => panic!("expected no pending traffic, got {other:?}"),
            }
        }

        /// Drain pending traffic, tolerating `peers`/`wait` refreshes
        /// but refusing anything that changes the schedule.
        fn assert_no_start(&mut self) {
            while let Ok(out) = self.rx.try_recv() {
                if let Outbound::Frame(ServerFrame::Start { peer_id }) = out {
                    panic!("unexpected start frame: {peer_id:?}");
                }
            }
        }

        fn frame(&self, frame: ClientFrame) -> RoomCommand {
            RoomCommand::Frame {
                cid: self.cid.clone(),
                conn_id: self.conn_id,
                frame,
            }
        }

        fn disconnect(&self) -> RoomCommand {
            RoomCommand::Disconnect {
                cid: self.cid.clone(),
                conn_id: self.conn_id,
            }
        }
    }

    fn connect(handle: &RoomHandle, cid: &str, conn_id: u64) -> TestSocket {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(handle.send(RoomCommand::Connect {
            cid: cid.to_string(),
            conn_id,
            outbound: tx,
        }));
        TestSocket {
            cid: cid.to_string(),
            conn_id,
            rx,
        }
    }

    fn room(max_concurrent: u8) -> RoomHandle {
        spawn_room(
            "TESTROOM23".into(),
            RoomConfig {
                max_concurrent,
                creator_cid: None,
            },
        )
    }

    async fn settle() {
        // The actor runs on the same runtime; yielding twice lets it
        // drain everything already enqueued.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
    }

    fn is_start(frame: &ServerFrame) -> bool {
        matches!(frame, ServerFrame::Start { .. })
    }

    #[tokio::test]
    async fn first_socket_is_offerer_then_answerers() {
        let handle = room(3);
        let mut sender = connect(&handle, "s", 1);
        match sender.recv().await {
            ServerFrame::Role { role, cid } => {
                assert_eq!(role, Role::Offerer);
                assert_eq!(cid, "s");
            }
            other => panic!("expected role, got {other:?}"),
        }

        let mut rx = connect(&handle, "a", 2);
        match rx.recv().await {
            ServerFrame::Role { role, .. } => assert_eq!(role, Role::Answerer),
            other => panic!("expected role, got {other:?}"),
        }
        match rx.recv().await {
            ServerFrame::Wait { position } => assert_eq!(position, Some(1)),
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn creator_pin_decides_roles_regardless_of_join_order() {
        let handle = spawn_room(
            "TESTROOM23".into(),
            RoomConfig {
                max_concurrent: 3,
                creator_cid: Some("owner".into()),
            },
        );
        let mut first = connect(&handle, "guest", 1);
        match first.recv().await {
            ServerFrame::Role { role, .. } => assert_eq!(role, Role::Answerer),
            other => panic!("expected role, got {other:?}"),
        }
        let mut owner = connect(&handle, "owner", 2);
        match owner.recv().await {
            ServerFrame::Role { role, .. } => assert_eq!(role, Role::Offerer),
            other => panic!("expected role, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_to_one_start_and_authorized_relay() {
        let handle = room(3);
        let mut sender = connect(&handle, "s", 1);
        let mut rx = connect(&handle, "a", 2);

        let start = sender.recv_until(is_start).await;
        match start {
            ServerFrame::Start { peer_id } => assert_eq!(peer_id.as_deref(), Some("a")),
            other => panic!("expected start, got {other:?}"),
        }
        rx.recv_until(|f| matches!(f, ServerFrame::Start { peer_id: None }))
            .await;

        // Authorized offer goes through with `from` substituted.
        handle.send(sender.frame(ClientFrame::Offer {
            to: "a".into(),
            sid: 1,
            sdp: json!({"type": "offer", "sdp": "v=0"}),
        }));
        match rx.recv().await {
            ServerFrame::Offer { from, sid, sdp } => {
                assert_eq!(from, "s");
                assert_eq!(sid, 1);
                assert_eq!(sdp["sdp"], "v=0");
            }
            other => panic!("expected offer, got {other:?}"),
        }

        // Answer flows back under the same pair.
        handle.send(rx.frame(ClientFrame::Answer {
            to: "s".into(),
            sid: 1,
            sdp: json!({"type": "answer", "sdp": "v=0"}),
        }));
        match sender.recv().await {
            ServerFrame::Answer { from, sid, .. } => {
                assert_eq!(from, "a");
                assert_eq!(sid, 1);
            }
            other => panic!("expected answer, got {other:?}"),
        }

        // Candidates relay in both directions.
        handle.send(sender.frame(ClientFrame::Candidate {
            to: "a".into(),
            sid: 1,
            candidate: json!({"candidate": "candidate:0"}),
        }));
        match rx.recv().await {
            ServerFrame::Candidate { from, .. } => assert_eq!(from, "s"),
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_relays_are_dropped() {
        let handle = room(3);
        let mut sender = connect(&handle, "s", 1);
        let mut rx_a = connect(&handle, "a", 2);
        sender.recv_until(is_start).await;
        rx_a.recv_until(is_start).await;

        // Offer to an unpaired cid vanishes.
        handle.send(sender.frame(ClientFrame::Offer {
            to: "ghost".into(),
            sid: 1,
            sdp: json!({}),
        }));
        // Answerer may not originate offers, even to its paired sender.
        handle.send(rx_a.frame(ClientFrame::Offer {
            to: "s".into(),
            sid: 1,
            sdp: json!({}),
        }));
        // transfer-done from an answerer is ignored.
        handle.send(rx_a.frame(ClientFrame::TransferDone {
            peer_id: "a".into(),
        }));
        settle().await;

        sender.assert_idle();
        rx_a.assert_idle();
    }

    #[tokio::test]
    async fn queueing_promotes_fifo_on_transfer_done() {
        let handle = room(2);
        let mut sender = connect(&handle, "s", 1);
        let mut rx_a = connect(&handle, "a", 2);
        let mut rx_b = connect(&handle, "b", 3);
        let mut rx_c = connect(&handle, "c", 4);

        // A and B fill the two slots; C queues.
        for expected in ["a", "b"] {
            let frame = sender.recv_until(is_start).await;
            match frame {
                ServerFrame::Start { peer_id } => assert_eq!(peer_id.as_deref(), Some(expected)),
                other => panic!("expected start, got {other:?}"),
            }
        }
        rx_a.recv_until(is_start).await;
        rx_b.recv_until(is_start).await;
        let wait = rx_c
            .recv_until(|f| matches!(f, ServerFrame::Wait { .. }))
            .await;
        match wait {
            ServerFrame::Wait { position } => assert_eq!(position, Some(1)),
            other => panic!("expected wait, got {other:?}"),
        }

        // Finishing A frees a slot for C; B is untouched.
        handle.send(sender.frame(ClientFrame::TransferDone {
            peer_id: "a".into(),
        }));
        let frame = sender.recv_until(is_start).await;
        match frame {
            ServerFrame::Start { peer_id } => assert_eq!(peer_id.as_deref(), Some("c")),
            other => panic!("expected start, got {other:?}"),
        }
        rx_c.recv_until(|f| matches!(f, ServerFrame::Start { peer_id: None }))
            .await;
        settle().await;
        rx_b.assert_no_start();

        // Repeating transfer-done for A changes nothing.
        handle.send(sender.frame(ClientFrame::TransferDone {
            peer_id: "a".into(),
        }));
        settle().await;
        sender.assert_no_start();
        rx_a.assert_no_start();
    }

    #[tokio::test]
    async fn done_receivers_are_never_reactivated() {
        let handle = room(1);
        let mut sender = connect(&handle, "s", 1);
        let mut rx_a = connect(&handle, "a", 2);
        sender.recv_until(is_start).await;
        rx_a.recv_until(is_start).await;

        handle.send(sender.frame(ClientFrame::TransferDone {
            peer_id: "a".into(),
        }));
        settle().await;

        // The sender leaves and comes back; only unfinished receivers
        // would be rescheduled, and there are none.
        handle.send(sender.disconnect());
        settle().await;
        let mut sender2 = connect(&handle, "s", 3);
        sender2
            .recv_until(|f| matches!(f, ServerFrame::Role { .. } | ServerFrame::Peers { .. }))
            .await;
        settle().await;
        // No start frame for "a" may arrive.
        while let Ok(out) = sender2.rx.try_recv() {
            if let Outbound::Frame(ServerFrame::Start { peer_id }) = out {
                panic!("done receiver was reactivated: {peer_id:?}");
            }
        }
    }

    #[tokio::test]
    async fn sender_departure_resets_active_receivers() {
        let handle = room(2);
        let mut sender = connect(&handle, "s", 1);
        let mut rx_a = connect(&handle, "a", 2);
        let mut rx_b = connect(&handle, "b", 3);
        rx_a.recv_until(is_start).await;
        rx_b.recv_until(is_start).await;

        handle.send(sender.disconnect());

        // Both receivers fall back to waiting with fresh positions.
        let wait_a = rx_a
            .recv_until(|f| matches!(f, ServerFrame::Wait { .. }))
            .await;
        match wait_a {
            ServerFrame::Wait { position } => assert_eq!(position, Some(1)),
            other => panic!("expected wait, got {other:?}"),
        }
        let wait_b = rx_b
            .recv_until(|f| matches!(f, ServerFrame::Wait { .. }))
            .await;
        match wait_b {
            ServerFrame::Wait { position } => assert_eq!(position, Some(2)),
            other => panic!("expected wait, got {other:?}"),
        }

        // A rejoining sender promotes them again, oldest join first.
        let mut sender2 = connect(&handle, "s", 4);
        for expected in ["a", "b"] {
            let frame = sender2.recv_until(is_start).await;
            match frame {
                ServerFrame::Start { peer_id } => assert_eq!(peer_id.as_deref(), Some(expected)),
                other => panic!("expected start, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn receiver_departure_frees_slot_and_notifies_sender() {
        let handle = room(1);
        let mut sender = connect(&handle, "s", 1);
        let mut rx_a = connect(&handle, "a", 2);
        let mut rx_b = connect(&handle, "b", 3);
        sender.recv_until(is_start).await;
        rx_a.recv_until(is_start).await;

        handle.send(rx_a.disconnect());
        let left = sender
            .recv_until(|f| matches!(f, ServerFrame::PeerLeft { .. }))
            .await;
        match left {
            ServerFrame::PeerLeft { peer_id } => assert_eq!(peer_id, "a"),
            other => panic!("expected peer-left, got {other:?}"),
        }
        // The freed slot goes to B.
        let frame = sender.recv_until(is_start).await;
        match frame {
            ServerFrame::Start { peer_id } => assert_eq!(peer_id.as_deref(), Some("b")),
            other => panic!("expected start, got {other:?}"),
        }
        rx_b.recv_until(|f| matches!(f, ServerFrame::Start { peer_id: None }))
            .await;
    }

    #[tokio::test]
    async fn same_cid_reconnect_evicts_with_graceful_close() {
        let handle = room(3);
        let mut sender = connect(&handle, "s", 1);
        let mut old = connect(&handle, "a", 2);
        sender.recv_until(is_start).await;
        old.recv_until(is_start).await;

        let mut fresh = connect(&handle, "a", 3);
        let (code, reason) = old.recv_close().await;
        assert_eq!(code, CLOSE_REPLACED_CODE);
        assert_eq!(reason, CLOSE_REPLACED_REASON);

        // The old pairing is dissolved and the sender told about it;
        // the replacement queues again and gets its own promotion.
        sender
            .recv_until(
                |f| matches!(f, ServerFrame::PeerLeft { peer_id } if peer_id == "a"),
            )
            .await;
        fresh
            .recv_until(|f| matches!(f, ServerFrame::Start { peer_id: None }))
            .await;

        // The stale socket's disconnect only refreshes peers.
        handle.send(RoomCommand::Disconnect {
            cid: "a".into(),
            conn_id: 2,
        });
        settle().await;
        let frame = fresh.recv().await;
        assert!(
            matches!(frame, ServerFrame::Peers { count: 2 }),
            "expected peers refresh, got {frame:?}"
        );
    }

    #[tokio::test]
    async fn sender_reconnect_with_same_cid_preserves_pairs() {
        let handle = room(3);
        let mut sender = connect(&handle, "s", 1);
        let mut rx_a = connect(&handle, "a", 2);
        sender.recv_until(is_start).await;
        rx_a.recv_until(is_start).await;

        // Eviction, not departure: the receiver stays active.
        let mut sender2 = connect(&handle, "s", 3);
        sender.recv_close().await;
        settle().await;
        while let Ok(out) = rx_a.rx.try_recv() {
            if let Outbound::Frame(ServerFrame::Wait { .. }) = out {
                panic!("active receiver was demoted on sender eviction");
            }
        }

        // The preserved pair still authorizes the relay.
        handle.send(RoomCommand::Frame {
            cid: "s".into(),
            conn_id: 3,
            frame: ClientFrame::Offer {
                to: "a".into(),
                sid: 7,
                sdp: json!({}),
            },
        });
        let frame = rx_a
            .recv_until(|f| matches!(f, ServerFrame::Offer { .. }))
            .await;
        match frame {
            ServerFrame::Offer { from, sid, .. } => {
                assert_eq!(from, "s");
                assert_eq!(sid, 7);
            }
            other => panic!("expected offer, got {other:?}"),
        }
        let _ = sender2;
    }

    #[tokio::test]
    async fn frames_from_replaced_sockets_are_ignored() {
        let handle = room(3);
        let mut sender = connect(&handle, "s", 1);
        let mut rx_a = connect(&handle, "a", 2);
        sender.recv_until(is_start).await;
        rx_a.recv_until(is_start).await;

        let _sender2 = connect(&handle, "s", 3);
        // The evicted socket keeps talking through its old conn_id.
        handle.send(RoomCommand::Frame {
            cid: "s".into(),
            conn_id: 1,
            frame: ClientFrame::Offer {
                to: "a".into(),
                sid: 9,
                sdp: json!({}),
            },
        });
        settle().await;
        while let Ok(out) = rx_a.rx.try_recv() {
            if let Outbound::Frame(ServerFrame::Offer { .. }) = out {
                panic!("relay accepted a frame from a replaced socket");
            }
        }
    }

    #[tokio::test]
    async fn active_count_never_exceeds_ceiling() {
        let handle = room(2);
        let mut sender = connect(&handle, "s", 1);
        let mut receivers = Vec::new();
        for (idx, cid) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
            receivers.push(connect(&handle, cid, idx as u64 + 2));
        }
        settle().await;

        let mut starts = 0;
        while let Ok(out) = sender.rx.try_recv() {
            if let Outbound::Frame(ServerFrame::Start { .. }) = out {
                starts += 1;
            }
        }
        assert_eq!(starts, 2);
    }

    #[test]
    fn promotion_order_breaks_ties_by_cid() {
        let order = promotion_order(
            vec![
                (5, "zulu".to_string()),
                (5, "alpha".to_string()),
                (3, "mike".to_string()),
            ]
            .into_iter(),
        );
        assert_eq!(order, vec!["mike", "alpha", "zulu"]);
    }
}
