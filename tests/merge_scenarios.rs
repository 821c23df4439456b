//! Integration tests for merge planning and execution end to end.

use std::sync::Arc;

use falcata::attribute::{
    AttributeUpdater, CompressedOffsetReader, write_var_len_segment,
};
use falcata::error::Result;
use falcata::merge::{
    AttributeSchema, MergeConfig, MergeEngine, MergeStrategy, MergeStrategyRegistry, MergeTask,
};
use falcata::oplog::{
    Operation, OperationLogReader, OperationLogWriter, OperationReplayer, RemoveOperation,
    UpdateOperation,
};
use falcata::segment::{
    DeletionBitmap, LevelInfo, LevelMeta, LevelTopology, SegmentId, SegmentInfo,
    SegmentMergeInfo, Version, attr_data_path, segment_dir_name,
};
use falcata::storage::{FileStorage, MemoryStorage, Storage, StorageConfig};

/// Minimal in-memory pk index standing in for the live document catalog.
#[derive(Debug, Default)]
struct IndexTarget {
    docs: std::collections::HashMap<u64, falcata::oplog::DocLocation>,
    removed: Vec<(SegmentId, u32)>,
    updates: Vec<(SegmentId, u32, Vec<u8>, bool)>,
}

impl IndexTarget {
    fn insert(&mut self, pk: u64, segment_id: SegmentId, doc_id: u32) {
        self.docs
            .insert(pk, falcata::oplog::DocLocation { segment_id, doc_id });
    }

    fn doc_count(&self) -> usize {
        self.docs.len()
    }

    fn removed(&self) -> &[(SegmentId, u32)] {
        &self.removed
    }

    fn updates(&self) -> &[(SegmentId, u32, Vec<u8>, bool)] {
        &self.updates
    }
}

impl falcata::oplog::OperationTarget<u64> for IndexTarget {
    fn lookup(&self, pk: &u64) -> Option<falcata::oplog::DocLocation> {
        self.docs.get(pk).copied()
    }

    fn remove_document(&mut self, location: falcata::oplog::DocLocation) -> Result<()> {
        self.docs.retain(|_, loc| *loc != location);
        self.removed.push((location.segment_id, location.doc_id));
        Ok(())
    }

    fn update_attribute(
        &mut self,
        location: falcata::oplog::DocLocation,
        _attr_id: u32,
        value: &[u8],
        is_null: bool,
    ) -> Result<()> {
        self.updates
            .push((location.segment_id, location.doc_id, value.to_vec(), is_null));
        Ok(())
    }
}

fn merge_info(segment_id: SegmentId, doc_count: u32, delete_count: u32) -> SegmentMergeInfo {
    SegmentMergeInfo {
        segment_id,
        doc_count,
        delete_count,
        level: 0,
        column: 0,
    }
}

fn seed_segment(
    storage: &dyn Storage,
    segment_id: SegmentId,
    titles: &[&str],
    deleted_docs: &[u32],
) -> Result<()> {
    let info = SegmentInfo::built(segment_id, titles.len() as u32, 1_700_000_000);
    info.save(storage)?;

    let dir = segment_dir_name(segment_id);

    // attr 0: fixed-stride rank, attr 1: var-length title.
    let mut output = storage.create_output(&attr_data_path(&dir, 0))?;
    for (idx, _) in titles.iter().enumerate() {
        std::io::Write::write_all(&mut output, &(idx as u32).to_le_bytes())?;
    }
    output.close()?;

    let values: Vec<&[u8]> = titles.iter().map(|title| title.as_bytes()).collect();
    write_var_len_segment(storage, &dir, 1, &values)?;

    if !deleted_docs.is_empty() {
        let mut bitmap = DeletionBitmap::new(segment_id, titles.len() as u32);
        for &doc in deleted_docs {
            bitmap.delete_document(doc)?;
        }
        bitmap.save(storage)?;
    }
    Ok(())
}

fn schema() -> Vec<AttributeSchema> {
    vec![AttributeSchema::fixed(0, 4), AttributeSchema::var_len(1)]
}

fn read_titles(storage: &dyn Storage, segment_id: SegmentId, doc_count: u32) -> Result<Vec<String>> {
    let dir = segment_dir_name(segment_id);
    let data = {
        let mut input = storage.open_input(&attr_data_path(&dir, 1))?;
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut input, &mut buf)?;
        buf
    };
    let offsets = CompressedOffsetReader::init(
        doc_count,
        storage.open_input(&format!("{dir}/attr_1/offset"))?,
        None,
    )?;

    let mut titles = Vec::new();
    for doc in 0..doc_count {
        let start = offsets.offset(doc)? as usize;
        let (len, header) = falcata::util::varint::decode_u64(&data[start..])?;
        let begin = start + header;
        titles.push(String::from_utf8_lossy(&data[begin..begin + len as usize]).into_owned());
    }
    Ok(titles)
}

#[test]
fn test_specific_segments_plan_grouping() -> Result<()> {
    let registry = MergeStrategyRegistry::with_defaults();
    let mut strategy = registry.create("specific_segments")?;
    strategy.set_parameter("merge_segments=1,2;3")?;

    let infos = vec![
        merge_info(1, 10, 0),
        merge_info(2, 10, 0),
        merge_info(3, 10, 0),
        merge_info(4, 10, 0),
    ];
    let task = strategy.create_merge_task(&infos, &LevelInfo::sequence())?;

    assert_eq!(task.len(), 2);
    assert_eq!(task.plans[0].src_segment_ids, vec![1, 2]);
    assert_eq!(task.plans[1].src_segment_ids, vec![3]);
    assert!(task
        .plans
        .iter()
        .all(|plan| !plan.src_segment_ids.contains(&4)));
    Ok(())
}

#[test]
fn test_key_value_optimize_empty_when_all_bottom() -> Result<()> {
    let layout = LevelInfo {
        topology: LevelTopology::HashMod,
        column_count: 2,
        levels: vec![LevelMeta {
            level_idx: 0,
            topology: LevelTopology::HashMod,
            segment_ids: vec![1, 2],
            is_bottom: true,
        }],
    };
    let infos = vec![merge_info(1, 10, 0), merge_info(2, 10, 0)];

    let strategy = MergeStrategy::KeyValueOptimize;
    assert!(!strategy.need_merge(&infos, &layout));
    let task = strategy.create_merge_task(&infos, &layout)?;
    assert!(task.is_empty());
    Ok(())
}

#[test]
fn test_remove_absent_pk_is_a_noop() -> Result<()> {
    let mut target = IndexTarget::default();
    target.insert(1, 0, 0);

    let mut op = RemoveOperation::new(12345u64, 1);
    assert!(!op.process(&mut target, None)?);
    assert_eq!(target.doc_count(), 1);
    Ok(())
}

#[test]
fn test_end_to_end_merge_with_deletes_and_updates() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());

    seed_segment(storage.as_ref(), 1, &["alpha", "bravo", "charlie"], &[1])?;
    seed_segment(storage.as_ref(), 2, &["delta", "echo"], &[])?;

    // A later segment retitles doc 0 of segment 1.
    let mut updater = AttributeUpdater::new(1);
    updater.update(0, b"alpha-rewritten", false);
    updater.dump(storage.as_ref(), &segment_dir_name(1), 2)?;

    let registry = MergeStrategyRegistry::with_defaults();
    let strategy = registry.create("optimize")?;
    let infos = vec![merge_info(1, 3, 1), merge_info(2, 2, 0)];
    let task = strategy.create_merge_task(&infos, &LevelInfo::sequence())?;
    assert_eq!(task.len(), 1);

    let engine = MergeEngine::new(MergeConfig { thread_count: 2 }, Arc::clone(&storage));
    let outcome = engine.execute(&task, &schema(), 3)?;
    assert_eq!(outcome.stats.plans_executed, 1);
    assert_eq!(outcome.stats.docs_removed, 1);
    assert_eq!(outcome.new_segments, vec![3]);

    let titles = read_titles(storage.as_ref(), 3, 4)?;
    assert_eq!(titles, vec!["alpha-rewritten", "charlie", "delta", "echo"]);

    let version = engine.publish_version(None, &outcome, 1_700_000_100)?;
    assert_eq!(version.segment_ids, vec![3]);
    Ok(())
}

#[test]
fn test_empty_task_is_a_noop() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    seed_segment(storage.as_ref(), 1, &["only"], &[])?;

    let engine = MergeEngine::new(MergeConfig::default(), Arc::clone(&storage));
    let outcome = engine.execute(&MergeTask::empty(), &schema(), 2)?;
    assert_eq!(outcome.stats.plans_executed, 0);
    assert!(outcome.new_segments.is_empty());
    assert!(storage.file_exists("segment_1/segment_info.json"));
    Ok(())
}

#[test]
fn test_oplog_replay_then_merge() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    seed_segment(storage.as_ref(), 1, &["alpha", "bravo"], &[])?;

    // pk layout: doc i of segment 1 has pk 100 + i.
    let mut target = IndexTarget::default();
    target.insert(100, 1, 0);
    target.insert(101, 1, 1);

    let mut writer = OperationLogWriter::open(storage.as_ref(), "oplog")?;
    writer.append(&Operation::Remove(RemoveOperation::new(100u64, 10)))?;
    writer.append(&Operation::Update(UpdateOperation::new(
        101u64,
        11,
        1,
        b"bravo-updated".to_vec(),
        false,
    )))?;
    // Stale operation against a pk that never existed.
    writer.append(&Operation::Remove(RemoveOperation::new(999u64, 12)))?;
    writer.close()?;

    let mut reader = OperationLogReader::open(storage.as_ref(), "oplog")?;
    let stats = OperationReplayer.replay(&mut reader, &mut target)?;
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.skipped, 1);

    // Materialize the replay outcome: deletion bitmap + patch file.
    let mut bitmap = DeletionBitmap::new(1, 2);
    for &(_, doc_id) in target.removed() {
        bitmap.delete_document(doc_id)?;
    }
    bitmap.save(storage.as_ref())?;

    let mut updater = AttributeUpdater::new(1);
    for (_, doc_id, value, is_null) in target.updates() {
        updater.update(*doc_id, value, *is_null);
    }
    updater.dump(storage.as_ref(), &segment_dir_name(1), 1)?;

    let engine = MergeEngine::new(MergeConfig::default(), Arc::clone(&storage));
    let task = MergeTask {
        plans: vec![falcata::merge::MergePlan::new(vec![1])],
    };
    let outcome = engine.execute(&task, &schema(), 2)?;
    assert_eq!(outcome.stats.docs_removed, 1);

    let titles = read_titles(storage.as_ref(), 2, 1)?;
    assert_eq!(titles, vec!["bravo-updated"]);
    Ok(())
}

#[test]
fn test_file_storage_merge_and_publish() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let storage: Arc<dyn Storage> =
        Arc::new(FileStorage::new(dir.path(), StorageConfig::default())?);

    seed_segment(storage.as_ref(), 1, &["alpha", "bravo"], &[0])?;
    seed_segment(storage.as_ref(), 2, &["charlie"], &[])?;

    let engine = MergeEngine::new(MergeConfig::default(), Arc::clone(&storage));

    // A stale staging directory from a previous crash is discarded first.
    let mut stale = storage.create_output("segment_9.tmp/attr_0/data")?;
    std::io::Write::write_all(&mut stale, &[0u8; 4])?;
    stale.close()?;
    assert_eq!(engine.discard_partial_segments()?, 1);

    let task = MergeTask {
        plans: vec![falcata::merge::MergePlan::new(vec![1, 2])],
    };
    let outcome = engine.execute(&task, &schema(), 3)?;
    assert_eq!(outcome.new_segments, vec![3]);
    assert!(dir.path().join("segment_3/segment_info.json").exists());
    assert!(!dir.path().join("segment_3.tmp").exists());

    let mut previous = Version::new(0, 1_700_000_000);
    previous.add_segment(1)?;
    previous.add_segment(2)?;
    let version = engine.publish_version(Some(&previous), &outcome, 1_700_000_200)?;
    assert_eq!(version.version_id, 1);
    assert_eq!(version.segment_ids, vec![3]);

    let reloaded = Version::load_latest(storage.as_ref())?.unwrap();
    assert_eq!(reloaded.segment_ids, vec![3]);

    let titles = read_titles(storage.as_ref(), 3, 2)?;
    assert_eq!(titles, vec!["bravo", "charlie"]);
    Ok(())
}
