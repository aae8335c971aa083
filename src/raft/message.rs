use super::{Entry, Index, ReplicaId, Term};
use crate::encoding;

use serde_derive::{Deserialize, Serialize};

/// The broadcast sentinel identifier, addressing all peers at once. The
/// transport fans broadcast datagrams out to every other endpoint.
pub const BROADCAST: &str = "FFFF";

/// A message envelope passed between replicas and clients. The transport
/// multiplexes all traffic through a single shared port, demultiplexing by
/// destination id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub src: ReplicaId,
    /// The recipient, or "FFFF" to broadcast to all peers.
    pub dst: ReplicaId,
    /// The sender's current belief of the leader, or "FFFF" if unknown.
    pub leader: ReplicaId,
    /// The message payload, flattened into the envelope with a "type" tag.
    #[serde(flatten)]
    pub message: Message,
}

impl encoding::Value for Envelope {}

/// Unrecognized message fields. Clients may send fields we don't interpret;
/// they must be preserved onto correlated responses.
pub type Extra = serde_json::Map<String, serde_json::Value>;

/// A message payload. Client-originated messages carry a correlation id MID,
/// which every response copies back unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Announces a replica to the transport at startup. Carries nothing.
    Hello,

    /// A client read request.
    Get {
        /// The key to read.
        key: String,
        /// The correlation id, echoed on the response.
        #[serde(rename = "MID")]
        mid: String,
        /// Unrecognized fields, preserved onto the response.
        #[serde(flatten)]
        extra: Extra,
    },

    /// A client write request.
    Put {
        /// The key to write.
        key: String,
        /// The value to write.
        value: String,
        /// The correlation id, echoed on the response.
        #[serde(rename = "MID")]
        mid: String,
        /// Unrecognized fields, preserved onto the response.
        #[serde(flatten)]
        extra: Extra,
    },

    /// A successful client response. Carries the value for reads.
    Ok {
        /// The correlation id of the request.
        #[serde(rename = "MID")]
        mid: String,
        /// The read value. Absent keys yield the empty string.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        /// Unrecognized request fields, echoed back.
        #[serde(flatten)]
        extra: Extra,
    },

    /// A failed client response.
    Fail {
        /// The correlation id of the request.
        #[serde(rename = "MID")]
        mid: String,
        /// Unrecognized request fields, echoed back.
        #[serde(flatten)]
        extra: Extra,
    },

    /// Tells a client to retry against the envelope's leader, e.g. because we
    /// aren't the leader or can't serve the read yet.
    Redirect {
        /// The correlation id of the request.
        #[serde(rename = "MID")]
        mid: String,
        /// Unrecognized request fields, echoed back.
        #[serde(flatten)]
        extra: Extra,
    },

    /// Candidates solicit votes from all peers when campaigning.
    VoteRequest {
        /// The candidate's current term.
        term: Term,
        /// The candidate soliciting the vote (also the envelope src).
        candidate_id: ReplicaId,
        /// The index of the candidate's last log entry.
        last_log_index: Index,
        /// The term of the candidate's last log entry.
        last_log_term: Term,
    },

    /// A response to a vote request. Carries the receiver's term so stale
    /// candidates can adopt it.
    VoteResponse {
        /// The voter's current term.
        term: Term,
        /// Whether the vote was granted.
        vote_granted: bool,
    },

    /// Leaders replicate log entries to followers, and assert leadership
    /// with empty heartbeats.
    AppendEntries {
        /// The leader's current term.
        term: Term,
        /// The index of the entry immediately preceding the batch, or the
        /// leader's last index for heartbeats.
        prev_log_index: Index,
        /// The term of the entry at prev_log_index, or 0 if none.
        prev_log_term: Term,
        /// The leader's commit index.
        leader_commit: Index,
        /// The entries to replicate. Empty for heartbeats.
        entries: Vec<Entry>,
    },

    /// A response to an append. Only refusals and entry-bearing appends are
    /// acknowledged; successful heartbeats are not.
    AppendEntriesResponse {
        /// The follower's current term.
        term: Term,
        /// Whether the entries were appended.
        success: bool,
        /// The follower's last log index, only on success with entries.
        #[serde(skip_serializing_if = "Option::is_none")]
        current_index: Option<Index>,
    },
}

impl Message {
    /// Returns the term carried by the message, if any. Client requests and
    /// responses are termless.
    pub fn term(&self) -> Option<Term> {
        match self {
            Message::VoteRequest { term, .. }
            | Message::VoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesResponse { term, .. } => Some(*term),
            Message::Hello
            | Message::Get { .. }
            | Message::Put { .. }
            | Message::Ok { .. }
            | Message::Fail { .. }
            | Message::Redirect { .. } => None,
        }
    }
}

/// A state machine command. Only puts are replicated through the log; gets
/// are served directly by the leader, but the wire format admits both.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Reads the value of a key.
    Get { key: String },
    /// Writes a value to a key.
    Put { key: String, value: String },
}

/// Commands cross the wire as ["GET", key] or ["PUT", key, value] arrays, so
/// the serde implementations are written by hand.
impl serde::Serialize for Command {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Command::Get { key } => serde::Serialize::serialize(&("GET", key), serializer),
            Command::Put { key, value } => {
                serde::Serialize::serialize(&("PUT", key, value), serializer)
            }
        }
    }
}

impl<'de> serde::Deserialize<'de> for Command {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(CommandVisitor)
    }
}

struct CommandVisitor;

impl<'de> serde::de::Visitor<'de> for CommandVisitor {
    type Value = Command;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "a [op, args...] command array")
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Command, A::Error> {
        use serde::de::Error as _;
        let op: String =
            seq.next_element()?.ok_or_else(|| A::Error::invalid_length(0, &self))?;
        let command = match op.as_str() {
            "GET" => {
                let key = seq.next_element()?.ok_or_else(|| A::Error::invalid_length(1, &self))?;
                Command::Get { key }
            }
            "PUT" => {
                let key = seq.next_element()?.ok_or_else(|| A::Error::invalid_length(1, &self))?;
                let value =
                    seq.next_element()?.ok_or_else(|| A::Error::invalid_length(2, &self))?;
                Command::Put { key, value }
            }
            op => return Err(A::Error::unknown_variant(op, &["GET", "PUT"])),
        };
        if seq.next_element::<serde::de::IgnoredAny>()?.is_some() {
            return Err(A::Error::custom("trailing command arguments"));
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;

    use serde_json::json;

    /// Asserts that the envelope encodes to exactly the given JSON, and
    /// decodes back to itself.
    #[track_caller]
    fn assert_wire(envelope: Envelope, want: serde_json::Value) {
        let bytes = envelope.encode().expect("encode failed");
        let have: serde_json::Value = serde_json::from_slice(&bytes).expect("invalid JSON");
        assert_eq!(have, want);
        assert_eq!(Envelope::decode(&bytes).expect("decode failed"), envelope);
    }

    fn envelope(src: &str, dst: &str, leader: &str, message: Message) -> Envelope {
        Envelope { src: src.into(), dst: dst.into(), leader: leader.into(), message }
    }

    #[test]
    fn hello() {
        assert_wire(
            envelope("0000", BROADCAST, BROADCAST, Message::Hello),
            json!({"src": "0000", "dst": "FFFF", "leader": "FFFF", "type": "hello"}),
        );
    }

    #[test]
    fn get() {
        assert_wire(
            envelope(
                "cli1",
                "0000",
                BROADCAST,
                Message::Get { key: "k".into(), mid: "m1".into(), extra: Extra::new() },
            ),
            json!({
                "src": "cli1", "dst": "0000", "leader": "FFFF",
                "type": "get", "key": "k", "MID": "m1",
            }),
        );
    }

    #[test]
    fn put() {
        assert_wire(
            envelope(
                "cli1",
                "0000",
                "0000",
                Message::Put {
                    key: "k".into(),
                    value: "v".into(),
                    mid: "m2".into(),
                    extra: Extra::new(),
                },
            ),
            json!({
                "src": "cli1", "dst": "0000", "leader": "0000",
                "type": "put", "key": "k", "value": "v", "MID": "m2",
            }),
        );
    }

    #[test]
    fn ok() {
        // A put response carries no value.
        assert_wire(
            envelope(
                "0000",
                "cli1",
                "0000",
                Message::Ok { mid: "m2".into(), value: None, extra: Extra::new() },
            ),
            json!({
                "src": "0000", "dst": "cli1", "leader": "0000",
                "type": "ok", "MID": "m2",
            }),
        );
        // A get response carries the value, the empty string for absent keys.
        assert_wire(
            envelope(
                "0000",
                "cli1",
                "0000",
                Message::Ok { mid: "m3".into(), value: Some("".into()), extra: Extra::new() },
            ),
            json!({
                "src": "0000", "dst": "cli1", "leader": "0000",
                "type": "ok", "MID": "m3", "value": "",
            }),
        );
    }

    #[test]
    fn fail_and_redirect() {
        assert_wire(
            envelope(
                "0001",
                "cli1",
                "0000",
                Message::Fail { mid: "m4".into(), extra: Extra::new() },
            ),
            json!({
                "src": "0001", "dst": "cli1", "leader": "0000",
                "type": "fail", "MID": "m4",
            }),
        );
        assert_wire(
            envelope(
                "0001",
                "cli1",
                "0000",
                Message::Redirect { mid: "m5".into(), extra: Extra::new() },
            ),
            json!({
                "src": "0001", "dst": "cli1", "leader": "0000",
                "type": "redirect", "MID": "m5",
            }),
        );
    }

    #[test]
    fn vote_request_and_response() {
        assert_wire(
            envelope(
                "0001",
                BROADCAST,
                BROADCAST,
                Message::VoteRequest {
                    term: 3,
                    candidate_id: "0001".into(),
                    last_log_index: 7,
                    last_log_term: 2,
                },
            ),
            json!({
                "src": "0001", "dst": "FFFF", "leader": "FFFF",
                "type": "vote_request", "term": 3, "candidate_id": "0001",
                "last_log_index": 7, "last_log_term": 2,
            }),
        );
        assert_wire(
            envelope(
                "0002",
                "0001",
                BROADCAST,
                Message::VoteResponse { term: 3, vote_granted: true },
            ),
            json!({
                "src": "0002", "dst": "0001", "leader": "FFFF",
                "type": "vote_response", "term": 3, "vote_granted": true,
            }),
        );
    }

    #[test]
    fn append_entries() {
        // An entry-bearing append, with the command as a nested array.
        assert_wire(
            envelope(
                "0000",
                BROADCAST,
                "0000",
                Message::AppendEntries {
                    term: 2,
                    prev_log_index: 1,
                    prev_log_term: 1,
                    leader_commit: 1,
                    entries: vec![
                        Entry {
                            index: 2,
                            term: 2,
                            command: Command::Put { key: "k".into(), value: "v".into() },
                        },
                        Entry { index: 3, term: 2, command: Command::Get { key: "k".into() } },
                    ],
                },
            ),
            json!({
                "src": "0000", "dst": "FFFF", "leader": "0000",
                "type": "append_entries", "term": 2, "prev_log_index": 1,
                "prev_log_term": 1, "leader_commit": 1,
                "entries": [[2, 2, ["PUT", "k", "v"]], [3, 2, ["GET", "k"]]],
            }),
        );
        // A heartbeat is an append with no entries.
        assert_wire(
            envelope(
                "0000",
                BROADCAST,
                "0000",
                Message::AppendEntries {
                    term: 2,
                    prev_log_index: 3,
                    prev_log_term: 2,
                    leader_commit: 3,
                    entries: Vec::new(),
                },
            ),
            json!({
                "src": "0000", "dst": "FFFF", "leader": "0000",
                "type": "append_entries", "term": 2, "prev_log_index": 3,
                "prev_log_term": 2, "leader_commit": 3, "entries": [],
            }),
        );
    }

    #[test]
    fn append_entries_response() {
        // An ack carries the follower's last index.
        assert_wire(
            envelope(
                "0001",
                "0000",
                "0000",
                Message::AppendEntriesResponse { term: 2, success: true, current_index: Some(3) },
            ),
            json!({
                "src": "0001", "dst": "0000", "leader": "0000",
                "type": "append_entries_response", "term": 2, "success": true,
                "current_index": 3,
            }),
        );
        // A refusal does not.
        assert_wire(
            envelope(
                "0001",
                "0000",
                BROADCAST,
                Message::AppendEntriesResponse { term: 2, success: false, current_index: None },
            ),
            json!({
                "src": "0001", "dst": "0000", "leader": "FFFF",
                "type": "append_entries_response", "term": 2, "success": false,
            }),
        );
    }

    /// Unknown fields on client requests must round-trip onto responses.
    #[test]
    fn unknown_fields_preserved() {
        let bytes = serde_json::to_vec(&json!({
            "src": "cli1", "dst": "0000", "leader": "FFFF",
            "type": "put", "key": "k", "value": "v", "MID": "m1",
            "tag": "opaque", "attempt": 3,
        }))
        .unwrap();
        let request = Envelope::decode(&bytes).expect("decode failed");
        let Message::Put { mid, extra, .. } = request.message else { panic!("expected put") };
        assert_eq!(extra.get("tag"), Some(&json!("opaque")));
        assert_eq!(extra.get("attempt"), Some(&json!(3)));

        // The response echoes the extras.
        let response = envelope("0000", "cli1", "0000", Message::Ok { mid, value: None, extra });
        let bytes = response.encode().expect("encode failed");
        let have: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            have,
            json!({
                "src": "0000", "dst": "cli1", "leader": "0000",
                "type": "ok", "MID": "m1", "tag": "opaque", "attempt": 3,
            })
        );
    }

    /// Malformed messages must fail to decode, not panic.
    #[test]
    fn decode_malformed() {
        for raw in [
            r#"{"src": "a", "dst": "b"}"#,                       // missing type
            r#"{"src": "a", "dst": "b", "leader": "c", "type": "bogus"}"#, // unknown type
            r#"{"type": "get", "key": "k", "MID": "m"}"#,        // missing envelope fields
            r#"not json"#,
            r#"{"src": "a", "dst": "b", "leader": "c", "type": "append_entries",
                "term": 1, "prev_log_index": 0, "prev_log_term": 0, "leader_commit": 0,
                "entries": [[1, 1, ["DEL", "k"]]]}"#,            // unknown command op
            r#"{"src": "a", "dst": "b", "leader": "c", "type": "append_entries",
                "term": 1, "prev_log_index": 0, "prev_log_term": 0, "leader_commit": 0,
                "entries": [[1, 1, ["PUT", "k", "v", "x"]]]}"#,  // trailing command args
        ] {
            assert!(Envelope::decode(raw.as_bytes()).is_err(), "decoded: {raw}");
        }
    }

    /// Command serialization is identity for both variants.
    #[test]
    fn command_roundtrip() {
        for command in [
            Command::Get { key: "k".into() },
            Command::Put { key: "k".into(), value: "v".into() },
            Command::Put { key: "".into(), value: "".into() },
        ] {
            let json = serde_json::to_string(&command).unwrap();
            let back: Command = serde_json::from_str(&json).unwrap();
            assert_eq!(back, command);
        }
    }
}
