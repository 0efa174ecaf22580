//! The exit-node cache: a line-oriented file remembering exit peers.
//!
//! Exit-flagged relays are scarce, so losing them all on restart hurts.
//! Whenever an exit candidate answers a probe we record its descriptor
//! here, and at startup the file pre-seeds the candidate table (still
//! unverified; they get probed like anyone else).  The file is rewritten
//! in place, newest first, and truncated once it grows past
//! [`EXIT_CACHE_MAX`] entries.
//!
//! Each line holds one peer:
//!
//! ```text
//! <peer id, hex> <last seen, unix secs> <flags> <overlay addr> <tunnel key, hex>
//! ```

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use murk_cell::{PeerDescriptor, PeerFlags, PeerId};

/// Most entries the cache file may hold; older ones are dropped first.
const EXIT_CACHE_MAX: usize = 100;
/// Name of the cache file inside the state directory.
const EXIT_CACHE_FILE: &str = "exit_cache.txt";

/// One remembered exit peer.
#[derive(Clone, Debug)]
struct Entry {
    /// The peer's descriptor.
    desc: PeerDescriptor,
    /// When we last saw the peer alive, unix seconds.
    last_seen: u64,
}

/// The cache of exit peers, merged from disk and this session.
#[derive(Debug)]
pub(crate) struct ExitCache {
    /// Where the cache lives; `None` disables persistence entirely.
    path: Option<PathBuf>,
    /// The merged entries, keyed by peer id.
    entries: HashMap<PeerId, Entry>,
    /// Whether anything changed since the last flush.
    dirty: bool,
}

impl ExitCache {
    /// Open the cache under `state_dir`, reading any existing file.
    pub(crate) fn open(state_dir: Option<&Path>) -> ExitCache {
        let path = state_dir.map(|d| d.join(EXIT_CACHE_FILE));
        let mut entries = HashMap::new();
        if let Some(p) = &path {
            match std::fs::read_to_string(p) {
                Ok(text) => {
                    for line in text.lines() {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        match parse_line(line) {
                            Some(e) => {
                                entries.insert(e.desc.id, e);
                            }
                            None => warn!("skipping malformed exit cache line"),
                        }
                    }
                    debug!(n = entries.len(), path = %p.display(), "loaded exit cache");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %p.display(), "could not read exit cache: {}", e),
            }
        }
        ExitCache {
            path,
            entries,
            dirty: false,
        }
    }

    /// The cached descriptors, newest first, for seeding candidates.
    pub(crate) fn descriptors(&self) -> Vec<PeerDescriptor> {
        let mut all: Vec<&Entry> = self.entries.values().collect();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        all.into_iter().map(|e| e.desc.clone()).collect()
    }

    /// Record that an exit peer was just seen alive.
    pub(crate) fn note_seen(&mut self, desc: &PeerDescriptor) {
        if self.path.is_none() || !desc.is_exit() {
            return;
        }
        self.entries.insert(
            desc.id,
            Entry {
                desc: desc.clone(),
                last_seen: unix_now(),
            },
        );
        self.dirty = true;
    }

    /// Rewrite the file if anything changed since the last flush.
    pub(crate) fn flush_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(path) = &self.path else {
            return;
        };
        let mut all: Vec<&Entry> = self.entries.values().collect();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        all.truncate(EXIT_CACHE_MAX);

        let mut text = String::from("# murk exit-node cache\n");
        for e in &all {
            text.push_str(&format_line(e));
            text.push('\n');
        }
        match write_replacing(path, text.as_bytes()) {
            Ok(()) => {
                debug!(n = all.len(), path = %path.display(), "flushed exit cache");
                self.dirty = false;
            }
            Err(e) => warn!(path = %path.display(), "could not write exit cache: {}", e),
        }
    }
}

/// Parse one cache line into an entry.
fn parse_line(line: &str) -> Option<Entry> {
    let mut fields = line.split_ascii_whitespace();
    let id: [u8; 20] = hex::decode(fields.next()?).ok()?.try_into().ok()?;
    let last_seen: u64 = fields.next()?.parse().ok()?;
    let flags: u8 = fields.next()?.parse().ok()?;
    let addr: std::net::SocketAddr = fields.next()?.parse().ok()?;
    let tunnel_key: [u8; 32] = hex::decode(fields.next()?).ok()?.try_into().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(Entry {
        desc: PeerDescriptor {
            id: PeerId::from_bytes(id),
            addr,
            tunnel_key,
            flags: PeerFlags::from_byte(flags),
        },
        last_seen,
    })
}

/// Render one entry as a cache line, without the trailing newline.
fn format_line(e: &Entry) -> String {
    format!(
        "{} {} {} {} {}",
        hex::encode(e.desc.id.as_bytes()),
        e.last_seen,
        e.desc.flags.as_byte(),
        e.desc.addr,
        hex::encode(e.desc.tunnel_key),
    )
}

/// Write `data` to `path` through a sibling temp file and a rename.
fn write_replacing(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Current wall-clock time as unix seconds.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use murk_proto::TunnelKeypair;
    use std::net::SocketAddr;

    fn exit_desc(port: u16) -> PeerDescriptor {
        let kp = TunnelKeypair::generate(&mut rand::thread_rng());
        PeerDescriptor {
            id: kp.peer_id(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            tunnel_key: kp.public_bytes(),
            flags: PeerFlags::RELAY | PeerFlags::EXIT_BT,
        }
    }

    #[test]
    fn survives_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let desc = exit_desc(6001);

        let mut cache = ExitCache::open(Some(dir.path()));
        cache.note_seen(&desc);
        cache.flush_if_dirty();

        let reopened = ExitCache::open(Some(dir.path()));
        let got = reopened.descriptors();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, desc.id);
        assert_eq!(got[0].addr, desc.addr);
        assert_eq!(got[0].tunnel_key, desc.tunnel_key);
        assert!(got[0].is_exit());
    }

    #[test]
    fn non_exits_are_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = exit_desc(6002);
        desc.flags = PeerFlags::RELAY;

        let mut cache = ExitCache::open(Some(dir.path()));
        cache.note_seen(&desc);
        cache.flush_if_dirty();

        assert!(ExitCache::open(Some(dir.path())).descriptors().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = exit_desc(6003);
        let good_line = format_line(&Entry {
            desc: good.clone(),
            last_seen: 12345,
        });
        let text = format!("# header\nnot a line\n{good_line}\ndeadbeef 1 2\n");
        std::fs::write(dir.path().join(EXIT_CACHE_FILE), text).unwrap();

        let cache = ExitCache::open(Some(dir.path()));
        let got = cache.descriptors();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, good.id);
    }

    #[test]
    fn oldest_entries_fall_off_past_the_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ExitCache::open(Some(dir.path()));
        let mut descs = Vec::new();
        for i in 0..(EXIT_CACHE_MAX + 5) {
            let d = exit_desc(7000 + i as u16);
            cache.note_seen(&d);
            descs.push(d);
        }
        // Make ages distinct so truncation order is deterministic.
        for (i, d) in descs.iter().enumerate() {
            cache.entries.get_mut(&d.id).unwrap().last_seen = i as u64;
        }
        cache.flush_if_dirty();

        let reopened = ExitCache::open(Some(dir.path()));
        let got = reopened.descriptors();
        assert_eq!(got.len(), EXIT_CACHE_MAX);
        // The five oldest are gone.
        for stale in &descs[..5] {
            assert!(got.iter().all(|d| d.id != stale.id));
        }
        // Newest first.
        assert_eq!(got[0].id, descs.last().unwrap().id);
    }

    #[test]
    fn disabled_cache_is_inert() {
        let mut cache = ExitCache::open(None);
        cache.note_seen(&exit_desc(6004));
        cache.flush_if_dirty();
        assert!(cache.descriptors().is_empty());
    }
}
