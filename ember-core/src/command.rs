//! Canonical command frame and reply types.

/// One parsed command as it travels through admission and dispatch.
///
/// The name is held in uppercase canonical form; arguments stay raw bytes
/// so binary-safe payloads survive the whole pipeline untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command name in uppercase canonical form (e.g. `SET`, `BLPOP`).
    pub name: String,
    /// Raw byte arguments, command name excluded.
    pub args: Vec<Vec<u8>>,
}

impl CommandFrame {
    /// Creates a frame from a name and argument list, normalizing the name.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        let mut name = name.into();
        name.make_ascii_uppercase();
        Self { name, args }
    }

    /// Approximate wire size of this frame, used for log byte accounting
    /// and throughput metrics.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.name.len() + self.args.iter().map(|arg| arg.len() + 1).sum::<usize>()
    }
}

/// Protocol-neutral command reply.
///
/// Encoding to RESP happens at the server's egress edge; everything inside
/// the execution core works on this enum so tests can assert replies
/// without byte-level comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// `+OK` style status replies.
    SimpleString(String),
    /// Binary-safe bulk payload.
    BulkString(Vec<u8>),
    /// Null bulk reply.
    Null,
    /// Integer reply.
    Integer(i64),
    /// Array reply.
    Array(Vec<CommandReply>),
    /// Null array, used by aborted transactions and blocking timeouts.
    NullArray,
    /// Error reply. The message starts with its category token
    /// (`ERR`, `NOAUTH`, `OOM`, `MOVED`, ...) so clients can branch on it.
    Error(String),
}

impl CommandReply {
    /// Builds the shared `+OK` status reply.
    #[must_use]
    pub fn ok() -> Self {
        Self::SimpleString("OK".to_owned())
    }

    /// Encodes the reply into RESP bytes.
    #[must_use]
    pub fn to_resp_bytes(&self) -> Vec<u8> {
        match self {
            Self::SimpleString(value) => {
                let mut output = Vec::with_capacity(value.len() + 3);
                output.push(b'+');
                output.extend_from_slice(value.as_bytes());
                output.extend_from_slice(b"\r\n");
                output
            }
            Self::BulkString(value) => {
                let mut output = format!("${}\r\n", value.len()).into_bytes();
                output.extend_from_slice(value);
                output.extend_from_slice(b"\r\n");
                output
            }
            Self::Null => b"$-1\r\n".to_vec(),
            Self::Integer(value) => format!(":{value}\r\n").into_bytes(),
            Self::Array(items) => {
                let mut output = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    output.extend_from_slice(&item.to_resp_bytes());
                }
                output
            }
            Self::NullArray => b"*-1\r\n".to_vec(),
            Self::Error(message) => {
                let mut output = Vec::with_capacity(message.len() + 3);
                output.push(b'-');
                output.extend_from_slice(message.as_bytes());
                output.extend_from_slice(b"\r\n");
                output
            }
        }
    }
}
