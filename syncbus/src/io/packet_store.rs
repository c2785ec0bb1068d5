//! Append-only packet history plus the `latest.md` pointer.
//!
//! History files are published with a no-clobber link and never rewritten.
//! `latest.md` is a full copy of the newest packet file, replaced atomically.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use tracing::{debug, info, instrument};

use crate::core::frontmatter;
use crate::core::packet_id::{PacketId, next_packet_id};
use crate::core::types::{InboxSignature, Packet};
use crate::io::atomic::{publish_new, write_atomic};

const PACKET_SUFFIX: &str = "_sync_packet.md";
const LATEST_NAME: &str = "latest.md";

#[derive(Debug, Clone)]
pub struct PacketStore {
    dir: PathBuf,
}

impl PacketStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn packet_path(&self, id: &PacketId) -> PathBuf {
        self.dir.join(format!("{id}{PACKET_SUFFIX}"))
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_NAME)
    }

    /// Identifiers of every packet in history, oldest first.
    pub fn history(&self) -> Result<Vec<PacketId>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read packets {}", self.dir.display()));
            }
        };
        let mut ids = Vec::new();
        for item in read_dir {
            let item = item.with_context(|| format!("read packets {}", self.dir.display()))?;
            let name = item.file_name();
            let Some(raw) = name.to_str().and_then(strip_packet_suffix) else {
                continue;
            };
            match raw.parse::<PacketId>() {
                Ok(id) => ids.push(id),
                Err(err) => debug!(name = %raw, err = %err, "ignoring unrecognized packet file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, id: &PacketId) -> Result<Packet> {
        let path = self.packet_path(id);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read packet {}", path.display()))?;
        parse_packet(&contents).with_context(|| format!("parse packet {}", path.display()))
    }

    /// The newest packet in history, if any.
    pub fn newest(&self) -> Result<Option<Packet>> {
        match self.history()?.last() {
            Some(id) => self.load(id).map(Some),
            None => Ok(None),
        }
    }

    /// Append a new packet. Never overwrites an existing history file: a
    /// collision with a concurrent writer moves on to the next sequence.
    #[instrument(skip_all, fields(signature = %signature.short()))]
    pub fn create(
        &self,
        signature: &InboxSignature,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Packet> {
        let mut newest = self.history()?.last().copied();
        loop {
            let id = next_packet_id(now, newest.as_ref())?;
            let packet = Packet {
                id,
                created_at: now.trunc_subsecs(0),
                source_signature: signature.clone(),
                body: body.trim().to_string(),
            };
            if publish_new(&self.packet_path(&id), &render_packet(&packet))? {
                info!(packet_id = %id, "packet created");
                return Ok(packet);
            }
            debug!(packet_id = %id, "packet id taken, retrying");
            newest = Some(id);
        }
    }

    pub fn read_latest_pointer(&self) -> Result<Option<Packet>> {
        let path = self.latest_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        parse_packet(&contents)
            .map(Some)
            .with_context(|| format!("parse {}", path.display()))
    }

    /// Point `latest.md` at `packet`.
    ///
    /// Returns `Ok(false)` without touching the file when it already holds
    /// exactly this packet. Refuses to move the pointer to an older packet.
    pub fn refresh_latest_pointer(&self, packet: &Packet) -> Result<bool> {
        let path = self.latest_path();
        let rendered = render_packet(packet);
        match fs::read_to_string(&path) {
            Ok(existing) if existing == rendered => {
                debug!(packet_id = %packet.id, "latest pointer already current");
                return Ok(false);
            }
            Ok(existing) => {
                if let Some(current) = parse_packet(&existing).ok().filter(|p| p.id > packet.id) {
                    bail!(
                        "latest pointer is at {} which is newer than {}",
                        current.id,
                        packet.id
                    );
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        }
        write_atomic(&path, &rendered)?;
        debug!(packet_id = %packet.id, "latest pointer refreshed");
        Ok(true)
    }
}

fn render_packet(packet: &Packet) -> String {
    frontmatter::render(
        &[
            ("id", packet.id.to_string()),
            (
                "created_at",
                packet.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("source_signature", packet.source_signature.to_string()),
        ],
        &packet.body,
    )
}

fn parse_packet(contents: &str) -> Result<Packet> {
    let doc = frontmatter::parse(contents).ok_or_else(|| anyhow!("missing frontmatter"))?;
    let field = |key: &str| doc.get(key).ok_or_else(|| anyhow!("missing field '{key}'"));
    let id: PacketId = field("id")?.parse()?;
    let created_at = DateTime::parse_from_rfc3339(field("created_at")?)
        .context("parse created_at")?
        .with_timezone(&Utc);
    let source_signature = InboxSignature::from_hex(field("source_signature")?);
    Ok(Packet {
        id,
        created_at,
        source_signature,
        body: doc.body,
    })
}

fn strip_packet_suffix(name: &str) -> Option<&str> {
    name.strip_suffix(PACKET_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 11, 14, 31, 35)
            .single()
            .expect("time")
    }

    fn sig(raw: &str) -> InboxSignature {
        InboxSignature::from_hex(raw)
    }

    #[test]
    fn create_twice_in_same_second_yields_distinct_packets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PacketStore::new(temp.path().join("packets"));

        let a = store.create(&sig("aa"), "first body", now()).expect("a");
        let b = store.create(&sig("bb"), "second body", now()).expect("b");

        assert!(a.id < b.id);
        assert_eq!(store.history().expect("history"), vec![a.id, b.id]);
        assert_eq!(store.load(&a.id).expect("load a"), a);
        assert_eq!(store.load(&b.id).expect("load b").body, "second body");
    }

    #[test]
    fn create_skips_ids_taken_by_another_writer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PacketStore::new(temp.path());
        let first = store.create(&sig("aa"), "one", now()).expect("first");

        // Simulate a racing writer that grabbed the next id first.
        let taken = next_packet_id(now(), Some(&first.id)).expect("next");
        fs::write(store.packet_path(&taken), "foreign").expect("write");

        let ours = store.create(&sig("bb"), "two", now()).expect("ours");
        assert!(ours.id > taken);
        assert_eq!(
            fs::read_to_string(store.packet_path(&taken)).expect("read"),
            "foreign"
        );
    }

    #[test]
    fn history_ignores_pointer_and_foreign_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PacketStore::new(temp.path());
        let packet = store.create(&sig("aa"), "body", now()).expect("create");
        store.refresh_latest_pointer(&packet).expect("refresh");
        fs::write(temp.path().join("notes_sync_packet.md"), "x").expect("write");

        assert_eq!(store.history().expect("history"), vec![packet.id]);
    }

    #[test]
    fn missing_dir_has_empty_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PacketStore::new(temp.path().join("absent"));
        assert!(store.history().expect("history").is_empty());
        assert!(store.newest().expect("newest").is_none());
        assert!(store.read_latest_pointer().expect("latest").is_none());
    }

    #[test]
    fn refresh_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PacketStore::new(temp.path());
        let packet = store.create(&sig("aa"), "body", now()).expect("create");

        assert!(store.refresh_latest_pointer(&packet).expect("first"));
        assert!(!store.refresh_latest_pointer(&packet).expect("second"));
        assert_eq!(
            store.read_latest_pointer().expect("read"),
            Some(packet.clone())
        );
        assert_eq!(
            fs::read_to_string(store.latest_path()).expect("latest"),
            fs::read_to_string(store.packet_path(&packet.id)).expect("packet"),
        );
    }

    #[test]
    fn refresh_refuses_to_move_backwards() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PacketStore::new(temp.path());
        let older = store.create(&sig("aa"), "old", now()).expect("older");
        let newer = store.create(&sig("bb"), "new", now()).expect("newer");
        store.refresh_latest_pointer(&newer).expect("refresh newer");

        let err = store.refresh_latest_pointer(&older).unwrap_err();
        assert!(err.to_string().contains("newer than"));
        assert_eq!(store.read_latest_pointer().expect("read"), Some(newer));
    }
}
