use super::{Command, Entry, Envelope, Index, Log, Message, State, BROADCAST};
use crate::encoding::json;
use crate::errinput;
use crate::error::Result;

use log::{debug, error, info};
use rand::Rng as _;
use std::collections::{HashMap, HashSet};

/// A replica ID: a short opaque identifier, 4 characters in practice.
pub type ReplicaId = String;

/// A leader term. Monotonically increasing; owned by at most one leader.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// Raft node options.
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts for followers.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// The range of randomized candidate deadlines, after which a stalled
    /// election restarts and granted votes go stale.
    pub candidate_timeout_range: std::ops::Range<Ticks>,
    /// Maximum number of entries in a single append message.
    pub max_append_entries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            election_timeout_range: super::ELECTION_TIMEOUT_RANGE,
            candidate_timeout_range: super::CANDIDATE_TIMEOUT_RANGE,
            max_append_entries: super::MAX_APPEND_ENTRIES,
        }
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step(), advancing time via tick(), and
/// broadcasting staged writes via flush(). These methods consume the current
/// node and return a new one with a possibly different role. Outbound
/// messages are sent via the given node_tx channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or leader
    /// if there are no peers.
    pub fn new(
        id: ReplicaId,
        peers: HashSet<ReplicaId>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let node = RawNode::new(id, peers, log, state, node_tx, opts)?;
        if node.peers.is_empty() {
            // If there are no peers, become leader immediately.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> &ReplicaId {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Processes an inbound message.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {:?}", msg);
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }

    /// Broadcasts any writes staged for replication. Called after each batch
    /// of inbound messages, so rapid writes coalesce into one burst.
    pub fn flush(self) -> Result<Self> {
        match self {
            Node::Leader(n) => n.flush(),
            node => Ok(node),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {
    /// The replica this role believes is the leader, for the envelope's
    /// leader field. "FFFF" if unknown.
    fn leader_hint(&self, id: &ReplicaId) -> ReplicaId;
}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: ReplicaId,
    peers: HashSet<ReplicaId>,
    term: Term,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            term: self.term,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            role,
        }
    }

    /// Returns the cluster size as number of replicas.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, i.e. the
    /// largest value replicated on a strict majority. The vector must have
    /// the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message to the given destination.
    fn send(&self, dst: &str, message: Message) -> Result<()> {
        let msg = Envelope {
            src: self.id.clone(),
            dst: dst.into(),
            leader: self.role.leader_hint(&self.id),
            message,
        };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers. The transport fans a single
    /// broadcast datagram out to every peer.
    fn broadcast(&self, message: Message) -> Result<()> {
        self.send(BROADCAST, message)
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Generates a randomized candidate deadline.
    fn gen_candidate_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.candidate_timeout_range.clone())
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert!(msg.dst == self.id || msg.dst == BROADCAST, "message to other node");
        // Peer RPCs must come from known peers; client ids are arbitrary.
        match msg.message {
            Message::VoteRequest { .. }
            | Message::VoteResponse { .. }
            | Message::AppendEntries { .. }
            | Message::AppendEntriesResponse { .. } => {
                assert!(self.peers.contains(&msg.src), "unknown peer {}", msg.src)
            }
            _ => {}
        }
    }

    /// Answers a stale-term message so the sender can adopt our term.
    /// Responses from stale terms are simply dropped.
    fn reply_stale(&self, msg: Envelope) -> Result<()> {
        match msg.message {
            Message::VoteRequest { .. } => self
                .send(&msg.src, Message::VoteResponse { term: self.term, vote_granted: false }),
            Message::AppendEntries { .. } => self.send(
                &msg.src,
                Message::AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    current_index: None,
                },
            ),
            _ => {
                debug!("Dropping message from past term ({msg:?})");
                Ok(())
            }
        }
    }

    /// Applies any pending committed log entries to the state machine.
    fn maybe_apply(&mut self) {
        for entry in self.log.scan_apply(self.state.applied_index()) {
            debug!("Applying {entry:?}");
            self.state.apply(entry);
        }
    }
}

/// A follower replicates state from a leader, or votes in elections.
pub struct Follower {
    /// The leader we're following, or None if no leader is known yet.
    leader: Option<ReplicaId>,
    /// The candidate we granted our vote to in this term, if any.
    voted_for: Option<ReplicaId>,
    /// Ticks since the last message asserting the leader's authority.
    leader_seen: Ticks,
    /// The leader_seen timeout before campaigning.
    election_timeout: Ticks,
    /// Ticks since we granted our vote.
    vote_age: Ticks,
    /// The vote_age threshold past which the vote goes stale: that election
    /// has stalled, and the vote may be released to a different candidate.
    vote_timeout: Ticks,
}

impl Follower {
    /// Creates a new follower role.
    fn new(leader: Option<ReplicaId>, election_timeout: Ticks) -> Self {
        Self {
            leader,
            voted_for: None,
            leader_seen: 0,
            election_timeout,
            vote_age: 0,
            vote_timeout: 0,
        }
    }
}

impl Role for Follower {
    fn leader_hint(&self, _id: &ReplicaId) -> ReplicaId {
        self.leader.clone().unwrap_or_else(|| BROADCAST.into())
    }
}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    fn new(
        id: ReplicaId,
        peers: HashSet<ReplicaId>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let role = Follower::new(None, 0);
        let mut node = Self { id, peers, term: 0, log, state, node_tx, opts, role };
        node.role.election_timeout = node.gen_election_timeout();
        Ok(node)
    }

    /// Asserts internal invariants.
    fn assert(&mut self) {
        if let Some(leader) = &self.role.leader {
            assert_ne!(leader, &self.id, "can't follow self");
            assert!(self.peers.contains(leader), "leader not in peers");
            assert_ne!(self.term, 0, "followers with leaders can't have term 0");
        }
        assert!(self.state.applied_index() <= self.log.commit_index(), "applied beyond commit");
    }

    /// Transitions the follower into a candidate, campaigning for leadership
    /// in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Apply any pending entries, so we're caught up if we win.
        self.maybe_apply();

        self.term += 1;
        let timeout = self.gen_candidate_timeout();
        let mut node = self.into_role(Candidate::new(timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into a follower, either a leaderless one in
    /// a new term (e.g. when someone starts an election) or following a
    /// leader in the current term once one asserts itself.
    fn into_follower(mut self, leader: Option<ReplicaId>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term, "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.role.election_timeout);
        } else {
            // We found a new term, but don't know the leader yet. We'll
            // discover it when we step a message from it.
            assert_ne!(term, self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.role = Follower::new(None, self.gen_election_timeout());
        }
        Ok(self)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        match msg.message.term() {
            // Answer stale-term peer RPCs with our current term.
            Some(term) if term < self.term => {
                self.reply_stale(msg)?;
                return Ok(self.into());
            }
            // Adopt a future term as a leaderless follower and step the
            // message. Responses carry no instructions; adopting is enough.
            Some(term) if term > self.term => {
                let node = self.into_follower(None, term)?;
                return match msg.message {
                    Message::VoteResponse { .. } | Message::AppendEntriesResponse { .. } => {
                        Ok(node.into())
                    }
                    _ => node.step(msg),
                };
            }
            _ => {}
        }

        match msg.message {
            // The leader asserts its authority with appends, both heartbeats
            // (no entries) and replication batches.
            Message::AppendEntries { prev_log_index, prev_log_term, leader_commit, entries, .. } => {
                if self.role.leader.is_none() {
                    let term = self.term;
                    self = self.into_follower(Some(msg.src.clone()), term)?;
                }
                assert_eq!(self.role.leader.as_ref(), Some(&msg.src), "multiple leaders in term");
                self.role.leader_seen = 0;

                // Ignore malformed batches rather than corrupting the log.
                if let Some(first) = entries.first() {
                    let contiguous = entries
                        .windows(2)
                        .all(|w| w[1].index == w[0].index + 1 && w[1].term >= w[0].term);
                    if first.index == 0
                        || first.term == 0
                        || first.index != prev_log_index + 1
                        || !contiguous
                    {
                        error!("Ignoring malformed entries from {}", msg.src);
                        return Ok(self.into());
                    }
                }

                // Test consistency against the entry preceding the batch (or
                // the leader's last entry for heartbeats). On mismatch,
                // refuse: the leader will walk next_index back and retry.
                if prev_log_index != 0 && !self.log.has(prev_log_index, prev_log_term) {
                    self.send(
                        &msg.src,
                        Message::AppendEntriesResponse {
                            term: self.term,
                            success: false,
                            current_index: None,
                        },
                    )?;
                    return Ok(self.into());
                }

                // Merge the entries. Only entry-bearing appends are
                // acknowledged; successful heartbeats need no ack.
                if !entries.is_empty() {
                    self.log.splice(entries);
                    self.send(
                        &msg.src,
                        Message::AppendEntriesResponse {
                            term: self.term,
                            success: true,
                            current_index: Some(self.log.last_index()),
                        },
                    )?;
                }

                // Advance the commit index and apply entries.
                let commit_index = leader_commit.min(self.log.last_index());
                if commit_index > self.log.commit_index() {
                    self.log.commit(commit_index);
                    self.maybe_apply();
                }
            }

            // A candidate solicits our vote.
            Message::VoteRequest { candidate_id, last_log_index, last_log_term, .. } => {
                // Don't vote while following a leader in this term; its
                // election already concluded.
                if self.role.leader.is_some() {
                    self.send(
                        &msg.src,
                        Message::VoteResponse { term: self.term, vote_granted: false },
                    )?;
                    return Ok(self.into());
                }

                // Don't vote if we already voted for someone else whose
                // election is still fresh. A stale vote is released: that
                // election has stalled, and granting a new candidate is what
                // gets a split vote unstuck.
                if let Some(voted_for) = &self.role.voted_for {
                    if *voted_for != candidate_id {
                        if self.role.vote_age < self.role.vote_timeout {
                            self.send(
                                &msg.src,
                                Message::VoteResponse { term: self.term, vote_granted: false },
                            )?;
                            return Ok(self.into());
                        }
                        self.role.voted_for = None;
                    }
                }

                // Don't vote if our log is more up-to-date than the
                // candidate's.
                let (log_index, log_term) = (self.log.last_index(), self.log.last_term());
                if log_term > last_log_term
                    || (log_term == last_log_term && log_index > last_log_index)
                {
                    self.send(
                        &msg.src,
                        Message::VoteResponse { term: self.term, vote_granted: false },
                    )?;
                    return Ok(self.into());
                }

                // Grant the vote.
                info!("Voting for {candidate_id} in term {} election", self.term);
                self.role.voted_for = Some(candidate_id);
                self.role.leader_seen = 0;
                self.role.vote_age = 0;
                self.role.vote_timeout = self.gen_candidate_timeout();
                self.send(&msg.src, Message::VoteResponse { term: self.term, vote_granted: true })?;
            }

            // Votes may arrive after we lost an election and followed the
            // winner. Ignore them.
            Message::VoteResponse { .. } => {}

            // We're not the leader; point the client at the one we believe
            // in (the envelope's leader field, "FFFF" if unknown).
            Message::Get { mid, extra, .. } | Message::Put { mid, extra, .. } => {
                self.send(&msg.src, Message::Redirect { mid, extra })?;
            }

            // Startup announcements carry no state.
            Message::Hello => {}

            // We're not a leader in this term, so we shouldn't see these.
            Message::AppendEntriesResponse { .. }
            | Message::Ok { .. }
            | Message::Fail { .. }
            | Message::Redirect { .. } => panic!("received unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.leader_seen = self.role.leader_seen.saturating_add(1);
        self.role.vote_age = self.role.vote_age.saturating_add(1);

        // Release a granted vote once that candidate's election has stalled,
        // so the election timeout below can fire again.
        if self.role.voted_for.is_some() && self.role.vote_age >= self.role.vote_timeout {
            self.role.voted_for = None;
        }

        // Campaign if we haven't heard from a leader within the election
        // timeout. While our granted vote is live we defer to that
        // candidate's election instead.
        if self.role.voted_for.is_none() && self.role.leader_seen >= self.role.election_timeout {
            return Ok(self.into_candidate()?.into());
        }
        Ok(self.into())
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received, including our own. A set, since the transport may
    /// duplicate datagrams.
    votes: HashSet<ReplicaId>,
    /// Ticks elapsed since the election started.
    election_duration: Ticks,
    /// The election deadline: past it, the election has stalled and is
    /// restarted at the same term.
    election_timeout: Ticks,
}

impl Candidate {
    /// Creates a new candidate role.
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {
    fn leader_hint(&self, _id: &ReplicaId) -> ReplicaId {
        BROADCAST.into()
    }
}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        assert_ne!(self.term, 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
    }

    /// Transitions the candidate to a follower. Either we lost the election
    /// and follow the winner, or we discovered a new term.
    fn into_follower(mut self, leader: Option<ReplicaId>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term, "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_timeout)))
        } else {
            // We found a new term, but don't know the leader yet.
            assert_ne!(term, self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            Ok(self.into_role(Follower::new(None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let peers = self.peers.clone();
        let last_index = self.log.last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));

        // Assert leadership immediately, suppressing further elections.
        node.heartbeat()?;
        node.maybe_commit_and_apply();

        Ok(node)
    }

    /// Campaigns for leadership by voting for ourself and soliciting votes
    /// from all peers. Called both when starting an election in a new term
    /// and when restarting a stalled one at the same term.
    fn campaign(&mut self) -> Result<()> {
        info!("Starting election for term {}", self.term);
        self.role = Candidate::new(self.gen_candidate_timeout());
        self.role.votes.insert(self.id.clone());

        let (last_log_index, last_log_term) = (self.log.last_index(), self.log.last_term());
        self.broadcast(Message::VoteRequest {
            term: self.term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        })
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        match msg.message.term() {
            // Answer stale-term peer RPCs with our current term.
            Some(term) if term < self.term => {
                self.reply_stale(msg)?;
                return Ok(self.into());
            }
            // Adopt a future term as a leaderless follower and step the
            // message.
            Some(term) if term > self.term => {
                let node = self.into_follower(None, term)?;
                return match msg.message {
                    Message::VoteResponse { .. } | Message::AppendEntriesResponse { .. } => {
                        Ok(node.into())
                    }
                    _ => node.step(msg),
                };
            }
            _ => {}
        }

        match msg.message {
            // Don't grant votes to other candidates in this term; our
            // self-vote stands until this election stalls and restarts.
            Message::VoteRequest { .. } => {
                self.send(&msg.src, Message::VoteResponse { term: self.term, vote_granted: false })?
            }

            // If we received a vote, record it, and assume leadership once a
            // strict majority of the cluster has voted for us.
            Message::VoteResponse { vote_granted: true, .. } => {
                self.role.votes.insert(msg.src);
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // We didn't get the vote; the tally stands.
            Message::VoteResponse { vote_granted: false, .. } => {}

            // A leader won this term's election. Follow it and step the
            // message.
            Message::AppendEntries { .. } => {
                let (leader, term) = (msg.src.clone(), self.term);
                return self.into_follower(Some(leader), term)?.step(msg);
            }

            // Clients must wait until the election settles; we know no
            // leader to point them at.
            Message::Get { mid, extra, .. } | Message::Put { mid, extra, .. } => {
                self.send(&msg.src, Message::Redirect { mid, extra })?;
            }

            Message::Hello => {}

            // We're not a leader in this term, so we shouldn't see these.
            Message::AppendEntriesResponse { .. }
            | Message::Ok { .. }
            | Message::Fail { .. }
            | Message::Redirect { .. } => panic!("received unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            // The election stalled, e.g. on a split vote. Restart it at the
            // same term; stale votes out there can now be re-won.
            self.campaign()?;
        }
        Ok(self.into())
    }
}

/// Follower replication progress, tracked by the leader.
struct Progress {
    /// The next log index to send to the follower.
    next_index: Index,
    /// The highest log index known to be replicated on the follower.
    match_index: Index,
}

impl Progress {
    /// Attempts to advance the follower's match index, returning true if it
    /// did. next_index follows it forward, but never regresses here; stale
    /// acks from a reordered transport must not move progress backwards.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = self.next_index.max(match_index + 1);
        true
    }

    /// Retreats next_index by one after a refused append, flooring at 1.
    fn retreat(&mut self) {
        self.next_index = (self.next_index - 1).max(1);
    }
}

/// A leader serves client requests and replicates the log to followers.
pub struct Leader {
    /// Follower replication progress.
    progress: HashMap<ReplicaId, Progress>,
    /// Newly accepted entries staged for the next replication burst.
    unsent: Vec<Entry>,
    /// Ticks since the last append broadcast (heartbeat or entries).
    since_heartbeat: Ticks,
}

impl Leader {
    /// Creates a new leader role.
    fn new(peers: HashSet<ReplicaId>, last_index: Index) -> Self {
        let next_index = last_index + 1;
        let progress = peers
            .into_iter()
            .map(|p| (p, Progress { next_index, match_index: 0 }))
            .collect();
        Self { progress, unsent: Vec::new(), since_heartbeat: 0 }
    }
}

impl Role for Leader {
    fn leader_hint(&self, id: &ReplicaId) -> ReplicaId {
        id.clone()
    }
}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        assert_ne!(self.term, 0, "leaders can't have term 0");
        let last_index = self.log.last_index();
        assert!(self.log.commit_index() <= last_index, "commit index beyond log");
        for (peer, progress) in &self.role.progress {
            assert_ne!(progress.next_index, 0, "next_index 0 for peer {peer}");
            assert!(progress.match_index <= last_index, "match index beyond log for peer {peer}");
        }
    }

    /// Steps down after discovering a new term, becoming a leaderless
    /// follower. Staged entries are dropped; if they reached a majority they
    /// will survive under the new leader, otherwise they're lost (the
    /// documented cost of the optimistic client ack).
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term, "leaders can only step down to a later term");
        info!("Discovered new term {term}, stepping down");
        self.term = term;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        match msg.message.term() {
            // Answer stale-term peer RPCs with our current term.
            Some(term) if term < self.term => {
                self.reply_stale(msg)?;
                return Ok(self.into());
            }
            // A higher term deposes us. Step down and step the message.
            Some(term) if term > self.term => {
                let node = self.into_follower(term)?;
                return match msg.message {
                    Message::VoteResponse { .. } | Message::AppendEntriesResponse { .. } => {
                        Ok(node.into())
                    }
                    _ => node.step(msg),
                };
            }
            _ => {}
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::AppendEntries { .. } => {
                panic!("saw other leader {} in term {}", msg.src, self.term)
            }

            // We already won this term's election.
            Message::VoteRequest { .. } => {
                self.send(&msg.src, Message::VoteResponse { term: self.term, vote_granted: false })?
            }

            // Votes may come in after we won. Ignore them.
            Message::VoteResponse { .. } => {}

            // A follower appended our entries. Record its progress, try to
            // commit, and keep feeding it if it's still behind.
            Message::AppendEntriesResponse {
                success: true,
                current_index: Some(current_index),
                ..
            } => {
                assert!(current_index <= self.log.last_index(), "follower acked unknown index");
                if self.progress(&msg.src).advance(current_index) {
                    self.maybe_commit_and_apply();
                }
                if self.progress(&msg.src).next_index <= self.log.last_index() {
                    self.send_append(&msg.src)?;
                }
            }

            // A follower refused an append: the entry preceding it didn't
            // match its log. Walk next_index back one step and retransmit
            // the tail from there.
            Message::AppendEntriesResponse { success: false, .. } => {
                self.progress(&msg.src).retreat();
                self.send_append(&msg.src)?;
            }

            Message::AppendEntriesResponse { .. } => {
                error!("Ignoring malformed ack from {}", msg.src)
            }

            // Admit a write: append it to our log, stage it for the next
            // replication burst, and ack the client optimistically. If we're
            // deposed before it commits, the write can be lost despite the
            // ack (the documented liveness choice).
            Message::Put { key, value, mid, extra } => {
                let response = match self.propose(Command::Put { key, value }) {
                    Ok(_) => Message::Ok { mid, value: None, extra },
                    Err(err) => {
                        error!("Rejecting put: {err}");
                        Message::Fail { mid, extra }
                    }
                };
                self.send(&msg.src, response)?;
                if self.peers.is_empty() {
                    self.maybe_commit_and_apply();
                }
            }

            // Serve a read from the state machine, unless an uncommitted
            // write to the key is still in the log tail; answering from
            // state would then be stale, so send the client back around
            // until the write commits.
            Message::Get { key, mid, extra } => {
                let pending = self
                    .log
                    .scan(self.log.commit_index() + 1..)
                    .any(|e| matches!(&e.command, Command::Put { key: k, .. } if *k == key));
                let response = if pending {
                    Message::Redirect { mid, extra }
                } else {
                    let value = self.state.read(&key).unwrap_or_default();
                    Message::Ok { mid, value: Some(value), extra }
                };
                self.send(&msg.src, response)?;
            }

            Message::Hello => {}

            // Leaders never send client requests, so we shouldn't see these.
            Message::Ok { .. } | Message::Fail { .. } | Message::Redirect { .. } => {
                panic!("received unexpected message {msg:?}")
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
        }
        Ok(self.into())
    }

    /// Broadcasts an empty append to assert leadership and advertise the
    /// commit index. Followers whose logs don't match our last entry will
    /// refuse it, triggering repair.
    fn heartbeat(&mut self) -> Result<()> {
        let (last_index, last_term) = (self.log.last_index(), self.log.last_term());
        self.broadcast(Message::AppendEntries {
            term: self.term,
            prev_log_index: last_index,
            prev_log_term: last_term,
            leader_commit: self.log.commit_index(),
            entries: Vec::new(),
        })?;
        self.role.since_heartbeat = 0;
        Ok(())
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress(&mut self, id: &ReplicaId) -> &mut Progress {
        self.role.progress.get_mut(id).expect("unknown peer")
    }

    /// Appends a command to our log at the current term and stages it for
    /// the next replication burst, returning its index.
    fn propose(&mut self, command: Command) -> Result<Index> {
        let size = json::serialize(&command)?.len();
        if size > super::MAX_COMMAND_SIZE {
            return errinput!("command of {size} bytes exceeds {}", super::MAX_COMMAND_SIZE);
        }
        let index = self.log.append(self.term, command);
        let entry = self.log.get(index).expect("missing appended entry").clone();
        self.role.unsent.push(entry);
        Ok(index)
    }

    /// Broadcasts any staged entries as a single replication burst, capped
    /// at the append batch size (the remainder goes out next flush).
    fn flush(mut self) -> Result<Node> {
        if self.role.unsent.is_empty() {
            return Ok(self.into());
        }
        let mut entries = std::mem::take(&mut self.role.unsent);
        if entries.len() > self.opts.max_append_entries {
            self.role.unsent = entries.split_off(self.opts.max_append_entries);
        }

        let prev_log_index = entries[0].index - 1;
        let prev_log_term = match prev_log_index {
            0 => 0,
            index => self.log.get(index).expect("missing base entry").term,
        };
        debug!("Replicating {} entries at base {prev_log_index}", entries.len());
        self.broadcast(Message::AppendEntries {
            term: self.term,
            prev_log_index,
            prev_log_term,
            leader_commit: self.log.commit_index(),
            entries,
        })?;
        self.role.since_heartbeat = 0;
        Ok(self.into())
    }

    /// Sends the log tail starting at the peer's next_index, as a unicast
    /// repair or catch-up batch.
    fn send_append(&mut self, peer: &ReplicaId) -> Result<()> {
        let next_index = self.role.progress.get(peer).expect("unknown peer").next_index;
        let prev_log_index = next_index - 1;
        let prev_log_term = match prev_log_index {
            0 => 0,
            index => self.log.get(index).expect("missing base entry").term,
        };
        let entries: Vec<Entry> =
            self.log.scan(next_index..).take(self.opts.max_append_entries).cloned().collect();
        if entries.is_empty() {
            return Ok(());
        }
        debug!("Replicating {} entries at base {prev_log_index} to {peer}", entries.len());
        self.send(
            peer,
            Message::AppendEntries {
                term: self.term,
                prev_log_index,
                prev_log_term,
                leader_commit: self.log.commit_index(),
                entries,
            },
        )
    }

    /// Commits any entries replicated on a quorum, and applies them to the
    /// state machine. Only an entry from our own term can establish a new
    /// commit index; prior-term entries commit underneath it (the Raft
    /// commit rule).
    fn maybe_commit_and_apply(&mut self) -> Index {
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.last_index()))
                .collect(),
        );
        if quorum_index <= self.log.commit_index() {
            return self.log.commit_index();
        }
        match self.log.get(quorum_index) {
            Some(entry) if entry.term == self.term => {}
            Some(_) => return self.log.commit_index(),
            None => panic!("missing entry at quorum index {quorum_index}"),
        }

        let commit_index = self.log.commit(quorum_index);
        self.maybe_apply();
        commit_index
    }
}
