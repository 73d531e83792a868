//! Turns one client command into the per-backend sub-commands it addresses.
//!
//! Most commands carry a single key in argument 1 and are forwarded as-is.
//! Multi-key commands listed in [`MULTI_KEY_COMMANDS`] are rewritten into one
//! independent single-key frame per key.

use super::protocols::{encode_command, CommandFrame, ProtocolError};

/// A multi-key command and the single-key verb each of its keys is sent with
#[derive(Debug, Clone, Copy)]
pub struct MultiKeyCommand {
    pub name: &'static str,
    pub single: &'static str,
    /// Arguments consumed per key (the key itself plus any values)
    pub stride: usize,
}

/// Fixed verb table for multi-key commands
pub const MULTI_KEY_COMMANDS: &[MultiKeyCommand] = &[
    MultiKeyCommand {
        name: "mget",
        single: "get",
        stride: 1,
    },
    MultiKeyCommand {
        name: "mset",
        single: "set",
        stride: 2,
    },
];

/// One unit of work for exactly one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubCommand {
    /// Position among the sub-commands of the parent command
    pub index: usize,
    /// Key used for bucket hashing (hash tag already applied)
    pub key: Vec<u8>,
    /// Bytes written to the backend
    pub payload: Vec<u8>,
}

pub fn lookup_multi_key(name: &str) -> Option<&'static MultiKeyCommand> {
    MULTI_KEY_COMMANDS.iter().find(|c| c.name == name)
}

/// Reduce a key to its hash tag when it carries one.
///
/// `user{42}` and `order{42,x}` both route as `42`. A tag is the text after the
/// first `{` up to the first following `}` or `,`.
pub fn routing_key(key: &[u8]) -> Result<&[u8], ProtocolError> {
    let open = key.iter().position(|&b| b == b'{');
    let close = key.iter().position(|&b| b == b'}');
    if open.is_none() && close.is_none() {
        return Ok(key);
    }

    let malformed = || {
        ProtocolError::BadFormat(format!(
            "malformed hash tag in key '{}'",
            String::from_utf8_lossy(key)
        ))
    };

    let start = open.ok_or_else(malformed)?;
    if close.is_some_and(|c| c < start) {
        return Err(malformed());
    }
    let len = key[start + 1..]
        .iter()
        .position(|&b| b == b'}' || b == b',')
        .ok_or_else(malformed)?;
    if len == 0 {
        return Err(malformed());
    }
    Ok(&key[start + 1..start + 1 + len])
}

/// Split a parsed frame into its routing units
pub fn split(frame: &CommandFrame) -> Result<Vec<SubCommand>, ProtocolError> {
    if frame.is_inline() {
        // Unframed commands have no key position; route on the whole line
        let line = frame.args().first().cloned().unwrap_or_default();
        return Ok(vec![SubCommand {
            index: 0,
            key: line,
            payload: frame.raw().to_vec(),
        }]);
    }

    let name = frame.name_lowercase();
    let args = frame.args();

    if let Some(multi) = lookup_multi_key(&name) {
        return split_multi_key(multi, args);
    }

    if args.len() < 2 {
        return Err(ProtocolError::BadArgsCount(format!(
            "'{}' needs a key argument",
            name
        )));
    }

    Ok(vec![SubCommand {
        index: 0,
        key: routing_key(&args[1])?.to_vec(),
        payload: frame.raw().to_vec(),
    }])
}

fn split_multi_key(
    multi: &MultiKeyCommand,
    args: &[Vec<u8>],
) -> Result<Vec<SubCommand>, ProtocolError> {
    let rest = &args[1..];
    if rest.is_empty() || rest.len() % multi.stride != 0 {
        return Err(ProtocolError::BadArgsCount(format!(
            "'{}' takes {} argument(s) per key, got {}",
            multi.name,
            multi.stride,
            rest.len()
        )));
    }

    rest.chunks(multi.stride)
        .enumerate()
        .map(|(index, unit)| {
            let mut sub_args: Vec<&[u8]> = Vec::with_capacity(multi.stride + 1);
            sub_args.push(multi.single.as_bytes());
            sub_args.extend(unit.iter().map(|a| a.as_slice()));
            Ok(SubCommand {
                index,
                key: routing_key(&unit[0])?.to_vec(),
                payload: encode_command(&sub_args),
            })
        })
        .collect()
}
