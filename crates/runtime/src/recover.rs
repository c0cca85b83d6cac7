use bytes::Bytes;
use checkpoint::RankStats;
use datastore::Store;
use protocol::value::DataType;
use protocol::{CreateSpec, DatumId};
use std::path::Path;

/// One checkpoint record decoded by the application: which datum it is
/// and the encoded value to restore.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub id: DatumId,
    pub data_type: DataType,
    pub bytes: Bytes,
}

/// Reload a checkpoint into the data store before the server loop runs.
///
/// Walks every rank recorded in the file (the writing job's count, not
/// ours), hands each intact record to `decode`, and restores the datums
/// this store owns as permanent, already-set data. Records other servers
/// own still count as valid here; each server runs its own pass over the
/// whole file. Corrupt and undecodable records are counted and skipped.
pub fn recover<F>(store: &mut Store, path: &Path, mut decode: F) -> checkpoint::Result<Vec<RankStats>>
where
    F: FnMut(&[u8], &[u8]) -> Option<Decoded>,
{
    let stats = checkpoint::reload(path, |_rank, record| {
        let Some(decoded) = decode(&record.key, &record.value) else {
            return false;
        };
        if !store.owns(decoded.id) {
            return true;
        }
        let spec = CreateSpec {
            hint: Some(decoded.id),
            data_type: decoded.data_type,
            read_rc: 0,
            write_rc: 1,
            permanent: true,
        };
        if store.create(&spec).is_err() {
            // A later record re-used the key; first write wins.
            return false;
        }
        store
            .store(decoded.id, decoded.data_type, None, decoded.bytes, 1)
            .is_ok()
    })?;
    // Restoration subscribes nobody; nothing to notify.
    let _ = store.drain_events();
    Ok(stats)
}
