//! Command execution against the store.
//!
//! Maps wire commands onto store operations and builds their replies.
//! Replies carry no trailing `\r\n`; the connection appends it.

use crate::protocol::{Command, Response};
use crate::storage::LruStorage;

/// What a finished command asks of the connection.
pub enum Outcome {
    Reply(Vec<u8>),
    /// Close the connection without replying (`quit`).
    Close,
}

pub fn execute(command: &Command, storage: &mut LruStorage, data: &[u8]) -> Outcome {
    match command {
        Command::Set { key } => Outcome::Reply(if storage.put(key, data) {
            Response::stored()
        } else {
            Response::not_stored()
        }),
        Command::Add { key } => Outcome::Reply(if storage.put_if_absent(key, data) {
            Response::stored()
        } else {
            Response::not_stored()
        }),
        Command::Replace { key } => Outcome::Reply(if storage.set(key, data) {
            Response::stored()
        } else {
            Response::not_stored()
        }),
        Command::Get { key } => Outcome::Reply(match storage.get(key) {
            Some(value) => Response::value(key, value),
            None => Response::end(),
        }),
        Command::Delete { key } => Outcome::Reply(if storage.delete(key) {
            Response::deleted()
        } else {
            Response::not_found()
        }),
        Command::Stats => Outcome::Reply(Response::stats(
            storage.len(),
            storage.current_bytes(),
            storage.max_bytes(),
        )),
        Command::Version => Outcome::Reply(Response::version()),
        Command::Quit => Outcome::Close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(outcome: Outcome) -> Vec<u8> {
        match outcome {
            Outcome::Reply(reply) => reply,
            Outcome::Close => panic!("expected a reply"),
        }
    }

    #[test]
    fn set_then_get() {
        let mut storage = LruStorage::new(1024);
        let set = Command::Set { key: b"foo".to_vec() };
        assert_eq!(reply(execute(&set, &mut storage, b"bar")), b"STORED");

        let get = Command::Get { key: b"foo".to_vec() };
        assert_eq!(
            reply(execute(&get, &mut storage, b"")),
            b"VALUE foo 3\r\nbar\r\nEND"
        );
    }

    #[test]
    fn get_miss_reports_end() {
        let mut storage = LruStorage::new(1024);
        let get = Command::Get { key: b"nope".to_vec() };
        assert_eq!(reply(execute(&get, &mut storage, b"")), b"END");
    }

    #[test]
    fn add_respects_existing_key() {
        let mut storage = LruStorage::new(1024);
        let add = Command::Add { key: b"k".to_vec() };
        assert_eq!(reply(execute(&add, &mut storage, b"v1")), b"STORED");
        assert_eq!(reply(execute(&add, &mut storage, b"v2")), b"NOT_STORED");
        assert_eq!(storage.get(b"k"), Some(&b"v1"[..]));
    }

    #[test]
    fn replace_requires_existing_key() {
        let mut storage = LruStorage::new(1024);
        let replace = Command::Replace { key: b"k".to_vec() };
        assert_eq!(reply(execute(&replace, &mut storage, b"v")), b"NOT_STORED");
        storage.put(b"k", b"old");
        assert_eq!(reply(execute(&replace, &mut storage, b"new")), b"STORED");
        assert_eq!(storage.get(b"k"), Some(&b"new"[..]));
    }

    #[test]
    fn delete_reports_presence() {
        let mut storage = LruStorage::new(1024);
        storage.put(b"k", b"v");
        let delete = Command::Delete { key: b"k".to_vec() };
        assert_eq!(reply(execute(&delete, &mut storage, b"")), b"DELETED");
        assert_eq!(reply(execute(&delete, &mut storage, b"")), b"NOT_FOUND");
    }

    #[test]
    fn oversize_set_is_not_stored() {
        let mut storage = LruStorage::new(4);
        let set = Command::Set { key: b"key".to_vec() };
        assert_eq!(reply(execute(&set, &mut storage, b"value")), b"NOT_STORED");
        assert!(storage.is_empty());
    }

    #[test]
    fn stats_reflect_storage() {
        let mut storage = LruStorage::new(64);
        storage.put(b"a", b"12");
        let out = reply(execute(&Command::Stats, &mut storage, b""));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("STAT curr_items 1"));
        assert!(text.contains("STAT bytes 3"));
        assert!(text.contains("STAT limit_maxbytes 64"));
        assert!(text.ends_with("END"));
    }

    #[test]
    fn quit_closes() {
        let mut storage = LruStorage::new(64);
        assert!(matches!(
            execute(&Command::Quit, &mut storage, b""),
            Outcome::Close
        ));
    }
}
