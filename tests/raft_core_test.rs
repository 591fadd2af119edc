use chrono::{TimeZone, Utc};
use docraft::config::RaftSettings;
use docraft::replicator::*;
use docraft::*;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

struct Sim {
    nodes: BTreeMap<String, RaftCore>,
    states: BTreeMap<String, SharedState>,
    isolated: HashSet<String>,
    now: Instant,
    sync_requests: usize,
}

impl Sim {
    fn new(ids: &[&str]) -> Self {
        Self::with_settings(ids, RaftSettings::default())
    }

    fn with_settings(ids: &[&str], settings: RaftSettings) -> Self {
        let storages = ids.iter().map(|id| (*id, MemStorage::new())).collect();
        Self::with_storages(storages, settings)
    }

    fn with_storages(storages: Vec<(&str, MemStorage)>, settings: RaftSettings) -> Self {
        let now = Instant::now();
        let ids: Vec<String> = storages.iter().map(|(id, _)| id.to_string()).collect();
        let mut nodes = BTreeMap::new();
        let mut states = BTreeMap::new();
        for (id, storage) in storages {
            let peers = ids.iter().filter(|p| p.as_str() != id).cloned().collect();
            let state = SharedState::new();
            let core = RaftCore::new(
                id.to_string(),
                peers,
                settings.clone(),
                MergePolicy::default(),
                Box::new(storage),
                state.clone(),
                now,
            )
            .unwrap();
            nodes.insert(id.to_string(), core);
            states.insert(id.to_string(), state);
        }
        Self {
            nodes,
            states,
            isolated: HashSet::new(),
            now,
            sync_requests: 0,
        }
    }

    fn core(&self, id: &str) -> &RaftCore {
        &self.nodes[id]
    }

    fn core_mut(&mut self, id: &str) -> &mut RaftCore {
        self.nodes.get_mut(id).unwrap()
    }

    fn elect(&mut self, id: &str) {
        let now = self.now;
        let ready = self.core_mut(id).start_election(now).unwrap();
        self.run(id, ready);
    }

    fn propose(&mut self, id: &str, command: Command) -> (LogIndex, Ready) {
        let now = self.now;
        let (index, _term, ready) = self.core_mut(id).propose(command, now).unwrap();
        let applied = Ready {
            messages: Vec::new(),
            applied: ready.applied,
        };
        self.run(
            id,
            Ready {
                messages: ready.messages,
                applied: Vec::new(),
            },
        );
        (index, applied)
    }

    /// Advances the clock one heartbeat interval and ticks only `id`.
    fn heartbeat(&mut self, id: &str) {
        self.now += Duration::from_millis(60);
        let now = self.now;
        let ready = self.core_mut(id).tick(now).unwrap();
        self.run(id, ready);
    }

    fn run(&mut self, origin: &str, ready: Ready) {
        let mut queue: VecDeque<(String, Outbound)> = ready
            .messages
            .into_iter()
            .map(|m| (origin.to_string(), m))
            .collect();
        let mut steps = 0;

        while let Some((from, message)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 10_000, "message pump did not settle");

            let to = message.to().clone();
            let cut = self.isolated.contains(&from) || self.isolated.contains(&to);
            let now = self.now;

            let next = match message {
                Outbound::Vote { request, .. } => {
                    if cut {
                        continue;
                    }
                    let resp = self.core_mut(&to).handle_request_vote(request, now).unwrap();
                    self.core_mut(&from).handle_vote_response(&to, resp, now).unwrap()
                }
                Outbound::Heartbeat { request, .. } => {
                    let sent_term = request.term;
                    if cut {
                        self.core_mut(&from).handle_peer_failure(&to, sent_term);
                        continue;
                    }
                    let (resp, ready) = self.core_mut(&to).handle_heartbeat(request, now).unwrap();
                    queue.extend(ready.messages.into_iter().map(|m| (to.clone(), m)));
                    self.core_mut(&from)
                        .handle_heartbeat_response(&to, sent_term, resp, now)
                        .unwrap()
                }
                Outbound::Replicate { request, .. } => {
                    let sent_term = request.term;
                    if cut {
                        self.core_mut(&from).handle_peer_failure(&to, sent_term);
                        continue;
                    }
                    let (resp, ready) = self
                        .core_mut(&to)
                        .handle_heartbeat(request.into(), now)
                        .unwrap();
                    queue.extend(ready.messages.into_iter().map(|m| (to.clone(), m)));
                    self.core_mut(&from)
                        .handle_heartbeat_response(&to, sent_term, resp, now)
                        .unwrap()
                }
                Outbound::Sync { request, .. } => {
                    self.sync_requests += 1;
                    if cut {
                        self.core_mut(&from).handle_sync_failure();
                        continue;
                    }
                    let resp = self.core_mut(&to).handle_sync_request(request, now).unwrap();
                    self.core_mut(&from).handle_sync_response(resp, now).unwrap()
                }
            };
            queue.extend(next.messages.into_iter().map(|m| (from.clone(), m)));
        }
    }

    fn leaders(&self) -> Vec<(String, Term)> {
        self.nodes
            .iter()
            .filter(|(_, core)| core.is_leader())
            .map(|(id, core)| (id.clone(), core.term()))
            .collect()
    }

    fn assert_election_safety(&self) {
        let leaders = self.leaders();
        let terms: HashSet<Term> = leaders.iter().map(|(_, term)| *term).collect();
        assert_eq!(terms.len(), leaders.len(), "two leaders share a term: {:?}", leaders);
    }
}

fn user(name: &str) -> Command {
    Command::CreateUser {
        username: name.to_string(),
        password_hash: "h".to_string(),
    }
}

fn seeded_storage(term: Term, log_terms: &[Term]) -> MemStorage {
    let mut storage = MemStorage::new();
    storage
        .save_hard_state(&HardState {
            current_term: term,
            voted_for: None,
        })
        .unwrap();
    let appended = log_terms
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let index = i as u64 + 1;
            let timestamp = Utc.timestamp_opt(1_700_000_000 + index as i64, 0).unwrap();
            LogEntry::new(*t, index, user(&format!("seed-{}", index)), timestamp)
        })
        .collect();
    storage
        .apply_log_change(&LogChange {
            truncated_from: None,
            appended,
        })
        .unwrap();
    storage
}

#[test]
fn test_new_core_starts_as_follower() {
    let sim = Sim::new(&["n1", "n2", "n3"]);
    let core = sim.core("n1");
    assert_eq!(core.role(), Role::Follower);
    assert_eq!(core.term(), 0);
    assert_eq!(core.commit_index(), 0);
    assert!(core.leader_id().is_none());
}

#[test]
fn test_single_node_elects_itself_and_commits() {
    let mut sim = Sim::new(&["solo"]);
    sim.elect("solo");

    let core = sim.core("solo");
    assert!(core.is_leader());
    assert_eq!(core.term(), 1);
    assert_eq!(core.commit_index(), 1);
    assert_eq!(core.log().get_entry(1).unwrap().command, Command::Noop);

    let (index, ready) = sim.propose("solo", user("alice"));
    assert_eq!(index, 2);
    assert_eq!(ready.applied.len(), 1);
    assert!(ready.applied[0].result.success);
    assert_eq!(sim.core("solo").last_applied(), 2);
}

#[test]
fn test_election_timeout_starts_campaign() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    let later = sim.now + Duration::from_millis(301);
    let ready = sim.core_mut("n1").tick(later).unwrap();

    assert_eq!(sim.core("n1").role(), Role::Candidate);
    assert_eq!(sim.core("n1").term(), 1);
    assert_eq!(sim.core("n1").voted_for().map(String::as_str), Some("n1"));
    assert_eq!(ready.messages.len(), 2);
    assert!(ready
        .messages
        .iter()
        .all(|m| matches!(m, Outbound::Vote { request, .. } if request.term == 1)));
}

#[test]
fn test_no_election_before_timeout() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    let soon = sim.now + Duration::from_millis(100);
    let ready = sim.core_mut("n1").tick(soon).unwrap();
    assert!(ready.is_empty());
    assert_eq!(sim.core("n1").role(), Role::Follower);
}

#[test]
fn test_three_node_election_and_replication() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    sim.elect("n1");

    assert!(sim.core("n1").is_leader());
    for id in ["n2", "n3"] {
        assert_eq!(sim.core(id).role(), Role::Follower);
        assert_eq!(sim.core(id).leader_id().map(String::as_str), Some("n1"));
        assert_eq!(sim.core(id).term(), 1);
    }
    assert_eq!(sim.core("n1").commit_index(), 1);

    let (index, _) = sim.propose("n1", user("alice"));
    assert_eq!(sim.core("n1").commit_index(), index);
    assert_eq!(sim.core("n1").last_applied(), index);

    sim.heartbeat("n1");
    for id in ["n2", "n3"] {
        assert_eq!(sim.core(id).commit_index(), index);
        assert!(sim.states[id].read(|s| s.users.contains_key("alice")));
    }
    assert_eq!(sim.states["n1"].snapshot(), sim.states["n2"].snapshot());
    sim.assert_election_safety();
}

#[test]
fn test_propose_on_follower_is_not_leader_with_hint() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    sim.elect("n1");

    let now = sim.now;
    let err = sim.core_mut("n2").propose(user("bob"), now).unwrap_err();
    match err {
        RaftError::NotLeader { leader_id, .. } => assert_eq!(leader_id.as_deref(), Some("n1")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_vote_granted_once_per_term() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    let now = sim.now;
    let core = sim.core_mut("n1");

    let first = core
        .handle_request_vote(
            VoteRequest {
                candidate_id: "n2".to_string(),
                term: 1,
                last_log_index: 0,
                last_log_term: 0,
            },
            now,
        )
        .unwrap();
    assert!(first.vote_granted);

    let second = core
        .handle_request_vote(
            VoteRequest {
                candidate_id: "n3".to_string(),
                term: 1,
                last_log_index: 0,
                last_log_term: 0,
            },
            now,
        )
        .unwrap();
    assert!(!second.vote_granted);

    let repeat = core
        .handle_request_vote(
            VoteRequest {
                candidate_id: "n2".to_string(),
                term: 1,
                last_log_index: 0,
                last_log_term: 0,
            },
            now,
        )
        .unwrap();
    assert!(repeat.vote_granted);
}

#[test]
fn test_vote_refused_to_stale_log() {
    let mut sim = Sim::with_storages(
        vec![
            ("n1", seeded_storage(2, &[1, 2])),
            ("n2", MemStorage::new()),
            ("n3", MemStorage::new()),
        ],
        RaftSettings::default(),
    );
    let now = sim.now;
    let core = sim.core_mut("n1");

    let older_term = core
        .handle_request_vote(
            VoteRequest {
                candidate_id: "n2".to_string(),
                term: 3,
                last_log_index: 5,
                last_log_term: 1,
            },
            now,
        )
        .unwrap();
    assert!(!older_term.vote_granted);
    assert_eq!(older_term.term, 3);

    let shorter = core
        .handle_request_vote(
            VoteRequest {
                candidate_id: "n3".to_string(),
                term: 3,
                last_log_index: 1,
                last_log_term: 2,
            },
            now,
        )
        .unwrap();
    assert!(!shorter.vote_granted);

    let up_to_date = core
        .handle_request_vote(
            VoteRequest {
                candidate_id: "n3".to_string(),
                term: 3,
                last_log_index: 2,
                last_log_term: 2,
            },
            now,
        )
        .unwrap();
    assert!(up_to_date.vote_granted);
}

#[test]
fn test_stale_term_messages_rejected() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    sim.elect("n1");
    sim.elect("n2");
    assert_eq!(sim.core("n1").term(), 2);

    let now = sim.now;
    let core = sim.core_mut("n1");
    let vote = core
        .handle_request_vote(
            VoteRequest {
                candidate_id: "n3".to_string(),
                term: 1,
                last_log_index: 10,
                last_log_term: 1,
            },
            now,
        )
        .unwrap();
    assert!(!vote.vote_granted);
    assert_eq!(vote.term, 2);

    let (resp, _) = core
        .handle_heartbeat(
            HeartbeatRequest {
                leader_id: "n3".to_string(),
                term: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                commit_index: 0,
            },
            now,
        )
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.term, 2);
    assert_eq!(core.leader_id().map(String::as_str), Some("n2"));
}

#[test]
fn test_leader_steps_down_on_higher_term() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    sim.elect("n1");
    assert!(sim.core("n1").is_leader());

    let now = sim.now;
    let core = sim.core_mut("n1");
    core.handle_request_vote(
        VoteRequest {
            candidate_id: "n3".to_string(),
            term: 5,
            last_log_index: 0,
            last_log_term: 0,
        },
        now,
    )
    .unwrap();

    assert_eq!(core.role(), Role::Follower);
    assert_eq!(core.term(), 5);
    assert!(core.leader_id().is_none());
}

#[test]
fn test_partitioned_leader_replaced() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    sim.elect("n1");
    sim.isolated.insert("n1".to_string());

    sim.elect("n2");
    assert!(sim.core("n2").is_leader());
    assert_eq!(sim.core("n2").term(), 2);
    assert!(sim.core("n1").is_leader());
    sim.assert_election_safety();

    sim.isolated.clear();
    sim.heartbeat("n2");
    assert_eq!(sim.core("n1").role(), Role::Follower);
    assert_eq!(sim.core("n1").term(), 2);
    assert_eq!(sim.leaders().len(), 1);
}

#[test]
fn test_isolated_leader_cannot_commit() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    sim.elect("n1");
    sim.isolated.insert("n2".to_string());
    sim.isolated.insert("n3".to_string());

    let (index, ready) = sim.propose("n1", user("alice"));
    assert!(ready.applied.is_empty());
    assert!(sim.core("n1").commit_index() < index);

    sim.isolated.clear();
    sim.heartbeat("n1");
    assert_eq!(sim.core("n1").commit_index(), index);
}

#[test]
fn test_follower_log_repaired_by_backoff() {
    let mut sim = Sim::with_storages(
        vec![
            ("n1", seeded_storage(3, &[1, 3])),
            ("n2", seeded_storage(3, &[1, 2, 2, 2])),
            ("n3", seeded_storage(3, &[1, 3])),
        ],
        RaftSettings::default(),
    );

    sim.elect("n1");
    assert!(sim.core("n1").is_leader());
    let leader_prefix: Vec<LogEntry> = sim.core("n1").log().entries().to_vec();

    sim.propose("n1", user("alice"));
    sim.heartbeat("n1");

    let leader_log = sim.core("n1").log().entries().to_vec();
    assert_eq!(&leader_log[..leader_prefix.len()], &leader_prefix[..]);
    for id in ["n2", "n3"] {
        let log = sim.core(id).log().entries().to_vec();
        assert_eq!(log.len(), leader_log.len());
        for (a, b) in log.iter().zip(leader_log.iter()) {
            assert_eq!(a.term, b.term);
            assert_eq!(a.command, b.command);
        }
    }
    assert_eq!(sim.core("n2").commit_index(), sim.core("n1").commit_index());
    assert_eq!(sim.states["n2"].snapshot(), sim.states["n1"].snapshot());
}

#[test]
fn test_prior_term_entry_not_committed_by_count() {
    let mut sim = Sim::with_storages(
        vec![
            ("n1", seeded_storage(2, &[1, 1])),
            ("n2", seeded_storage(2, &[1])),
            ("n3", seeded_storage(2, &[1])),
        ],
        RaftSettings::default(),
    );

    let now = sim.now;
    let ready = sim.core_mut("n1").start_election(now).unwrap();
    let votes: Vec<Outbound> = ready.messages;
    for vote in votes {
        if let Outbound::Vote { to, request } = vote {
            let resp = sim.core_mut(&to).handle_request_vote(request, now).unwrap();
            sim.core_mut("n1").handle_vote_response(&to, resp, now).unwrap();
        }
    }
    let leader = sim.core_mut("n1");
    assert!(leader.is_leader());
    assert_eq!(leader.term(), 3);
    assert_eq!(leader.log().last_index(), 3);

    leader
        .handle_heartbeat_response(
            &"n2".to_string(),
            3,
            HeartbeatResponse {
                term: 3,
                success: true,
                match_index: 2,
                last_log_index: 2,
                last_applied: 0,
            },
            now,
        )
        .unwrap();
    assert_eq!(leader.commit_index(), 0);

    let ready = leader
        .handle_heartbeat_response(
            &"n2".to_string(),
            3,
            HeartbeatResponse {
                term: 3,
                success: true,
                match_index: 3,
                last_log_index: 3,
                last_applied: 0,
            },
            now,
        )
        .unwrap();
    assert_eq!(leader.commit_index(), 3);
    assert_eq!(ready.applied.len(), 3);
}

#[test]
fn test_failed_heartbeat_backs_off_next_index() {
    let mut sim = Sim::with_storages(
        vec![
            ("n1", seeded_storage(1, &[1, 1, 1, 1])),
            ("n2", MemStorage::new()),
            ("n3", MemStorage::new()),
        ],
        RaftSettings::default(),
    );
    sim.elect("n1");

    let now = sim.now;
    let core = sim.core_mut("n1");
    assert!(core.is_leader());
    assert_eq!(core.peer_progress("n2").unwrap().next_index, 6);

    let ready = core
        .handle_heartbeat_response(
            &"n2".to_string(),
            2,
            HeartbeatResponse {
                term: 2,
                success: false,
                match_index: 0,
                last_log_index: 1,
                last_applied: 0,
            },
            now,
        )
        .unwrap();

    let progress = core.peer_progress("n2").unwrap();
    assert_eq!(progress.next_index, 2);
    assert!(progress.in_flight);
    assert!(matches!(
        &ready.messages[..],
        [Outbound::Heartbeat { request, .. }] if request.prev_log_index == 1
    ));
}

#[test]
fn test_follower_commit_never_decreases() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    sim.elect("n1");
    sim.propose("n1", user("alice"));
    sim.heartbeat("n1");
    let committed = sim.core("n2").commit_index();
    assert!(committed >= 2);

    let now = sim.now;
    let (resp, _) = sim
        .core_mut("n2")
        .handle_heartbeat(
            HeartbeatRequest {
                leader_id: "n1".to_string(),
                term: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                commit_index: 0,
            },
            now,
        )
        .unwrap();
    assert!(resp.success);
    assert_eq!(sim.core("n2").commit_index(), committed);
    assert_eq!(sim.core("n2").log().last_index(), 2);
}

#[test]
fn test_split_vote_resolves_in_later_term() {
    let mut sim = Sim::new(&["n1", "n2", "n3", "n4"]);
    let now = sim.now;

    let r1 = sim.core_mut("n1").start_election(now).unwrap();
    let r2 = sim.core_mut("n2").start_election(now).unwrap();
    let (to_n3, rest1): (Vec<_>, Vec<_>) = r1.messages.into_iter().partition(|m| m.to() == "n3");
    let (to_n4, rest2): (Vec<_>, Vec<_>) = r2.messages.into_iter().partition(|m| m.to() == "n4");

    sim.run("n1", Ready { messages: to_n3, applied: Vec::new() });
    sim.run("n2", Ready { messages: to_n4, applied: Vec::new() });
    sim.run("n1", Ready { messages: rest1, applied: Vec::new() });
    sim.run("n2", Ready { messages: rest2, applied: Vec::new() });

    assert!(sim.leaders().is_empty());
    assert_eq!(sim.core("n1").role(), Role::Candidate);
    assert_eq!(sim.core("n2").role(), Role::Candidate);

    let later = sim.now + Duration::from_millis(301);
    sim.now = later;
    let ready = sim.core_mut("n1").tick(later).unwrap();
    sim.run("n1", ready);

    let leaders = sim.leaders();
    assert_eq!(leaders, vec![("n1".to_string(), 2)]);
    assert_eq!(sim.core("n2").role(), Role::Follower);
    sim.assert_election_safety();
}

#[test]
fn test_lagging_follower_catches_up_with_sync() {
    let settings = RaftSettings {
        max_entries_per_message: 1,
        sync_lag_threshold: 2,
        ..RaftSettings::default()
    };
    let mut sim = Sim::with_settings(&["n1", "n2", "n3"], settings);
    sim.elect("n1");
    sim.isolated.insert("n3".to_string());

    for name in ["a", "b", "c", "d", "e", "f"] {
        sim.propose("n1", user(name));
    }
    let commit = sim.core("n1").commit_index();
    assert_eq!(commit, 7);

    sim.isolated.clear();
    sim.heartbeat("n1");
    sim.heartbeat("n1");

    assert!(sim.sync_requests > 0);
    assert_eq!(sim.core("n3").log().last_index(), 7);
    assert_eq!(sim.core("n3").commit_index(), 7);
    assert_eq!(sim.states["n3"].snapshot(), sim.states["n1"].snapshot());
}

#[test]
fn test_restart_restores_term_vote_and_state() {
    let storage = MemStorage::new();
    let mut sim = Sim::with_storages(vec![("solo", storage.clone())], RaftSettings::default());
    sim.elect("solo");
    sim.propose("solo", user("alice"));
    drop(sim);

    let restarted = Sim::with_storages(vec![("solo", storage)], RaftSettings::default());
    let core = restarted.core("solo");
    assert_eq!(core.term(), 1);
    assert_eq!(core.voted_for().map(String::as_str), Some("solo"));
    assert_eq!(core.log().last_index(), 2);
    assert_eq!(core.commit_index(), 2);
    assert!(restarted.states["solo"].read(|s| s.users.contains_key("alice")));
}

#[test]
fn test_status_reports_replica_fields() {
    let mut sim = Sim::new(&["n1", "n2", "n3"]);
    sim.elect("n1");
    let status = sim.core("n1").status();
    assert_eq!(status.node_id, "n1");
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.term, 1);
    assert_eq!(status.leader_id.as_deref(), Some("n1"));
    assert_eq!(status.log_length, 1);
    assert_eq!(status.commit_index, 1);
}

fn append_request(prev: (LogIndex, Term), entries: Vec<LogEntry>, commit_index: LogIndex) -> HeartbeatRequest {
    HeartbeatRequest {
        leader_id: "n1".to_string(),
        term: 1,
        prev_log_index: prev.0,
        prev_log_term: prev.1,
        entries,
        commit_index,
    }
}

#[test]
fn test_follower_does_not_ack_unpersisted_entries() {
    let n2 = MemStorage::new();
    let mut sim = Sim::with_storages(
        vec![("n1", MemStorage::new()), ("n2", n2.clone()), ("n3", MemStorage::new())],
        RaftSettings::default(),
    );
    sim.elect("n1");
    sim.isolated.insert("n2".to_string());
    sim.propose("n1", user("alice"));
    let entries = sim.core("n1").log().entries_from(2, 10);
    assert_eq!(entries.len(), 1);

    n2.fail_writes(true).unwrap();
    let now = sim.now;
    let result = sim
        .core_mut("n2")
        .handle_heartbeat(append_request((1, 1), entries.clone(), 0), now);
    assert!(result.is_err());
    assert_eq!(sim.core("n2").log().last_index(), 1);
    assert_eq!(n2.load_log().unwrap().len(), 1);

    n2.fail_writes(false).unwrap();
    let (resp, _) = sim
        .core_mut("n2")
        .handle_heartbeat(append_request((1, 1), entries, 0), now)
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.match_index, 2);
    assert_eq!(n2.load_log().unwrap().len(), 2);
}

#[test]
fn test_failed_proposal_leaves_log_unchanged() {
    let storage = MemStorage::new();
    let mut sim = Sim::with_storages(vec![("solo", storage.clone())], RaftSettings::default());
    sim.elect("solo");

    storage.fail_writes(true).unwrap();
    let now = sim.now;
    assert!(sim.core_mut("solo").propose(user("alice"), now).is_err());
    assert_eq!(sim.core("solo").log().last_index(), 1);
    assert_eq!(sim.core("solo").commit_index(), 1);

    storage.fail_writes(false).unwrap();
    let (index, _) = sim.propose("solo", user("alice"));
    assert_eq!(index, 2);
    assert_eq!(storage.load_log().unwrap().len(), 2);
    assert!(sim.states["solo"].read(|s| s.users.contains_key("alice")));
}

#[test]
fn test_state_write_failure_is_carried_into_next_apply() {
    let n2 = MemStorage::new();
    let mut sim = Sim::with_storages(
        vec![("n1", MemStorage::new()), ("n2", n2.clone()), ("n3", MemStorage::new())],
        RaftSettings::default(),
    );
    sim.elect("n1");
    sim.isolated.insert("n2".to_string());
    sim.propose("n1", user("alice"));
    sim.propose("n1", user("bob"));
    let entries = sim.core("n1").log().entries_from(2, 10);
    let now = sim.now;

    sim.core_mut("n2")
        .handle_heartbeat(append_request((1, 1), entries[..1].to_vec(), 0), now)
        .unwrap();
    n2.fail_writes(true).unwrap();
    let result = sim
        .core_mut("n2")
        .handle_heartbeat(append_request((2, 1), Vec::new(), 2), now);
    assert!(result.is_err());
    assert!(n2.load_state().unwrap().map_or(true, |s| !s.users.contains_key("alice")));

    n2.fail_writes(false).unwrap();
    sim.core_mut("n2")
        .handle_heartbeat(append_request((2, 1), entries[1..].to_vec(), 3), now)
        .unwrap();

    let restarted = Sim::with_storages(vec![("n2", n2)], RaftSettings::default());
    assert_eq!(restarted.core("n2").commit_index(), 3);
    assert_eq!(restarted.states["n2"].snapshot(), sim.states["n2"].snapshot());
    assert!(restarted.states["n2"].read(|s| s.users.contains_key("alice") && s.users.contains_key("bob")));
}

#[test]
fn test_apply_writes_only_touched_records() {
    let storage = MemStorage::new();
    let mut sim = Sim::with_storages(vec![("solo", storage.clone())], RaftSettings::default());
    sim.elect("solo");
    sim.propose("solo", user("alice"));
    let (_, ready) = sim.propose(
        "solo",
        Command::CreateDocument {
            title: "Notes".to_string(),
            username: "alice".to_string(),
        },
    );
    let document_id = ready.applied[0].result.document_id().unwrap().to_string();
    let writes = storage.state_writes().unwrap();

    sim.propose(
        "solo",
        Command::DeleteDocument {
            document_id: document_id.clone(),
            username: "alice".to_string(),
        },
    );
    assert_eq!(storage.state_writes().unwrap(), writes + 1);

    let saved = storage.load_state().unwrap().unwrap();
    assert_eq!(saved.last_applied, 4);
    assert!(saved.users.contains_key("alice"));
    assert!(!saved.documents.contains_key(&document_id));
    assert_eq!(saved, sim.states["solo"].snapshot());
}
