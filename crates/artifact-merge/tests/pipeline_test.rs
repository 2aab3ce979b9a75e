//! End-to-end pipeline tests against an in-memory blob store.
//!
//! A counting wrapper around the memory backend records every store call so
//! the tests can assert what was (and was not) fetched or written.

use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use artifact_merge::{
    run_job, ArtifactRef, BlobStore, Bytes, EncryptionPolicy, ErrorClass, FetchedObject, JobEvent,
    MergeOptions, MergePipeline, MergeRequest, ObjectHead, ObjectLocation, ObjectStoreBlobStore,
    PipelineError, PutRequest, RunReport, StagingArea, StoreResult,
};
use async_trait::async_trait;
use zip::write::SimpleFileOptions;
use zip::ZipArchive;

const BUCKET: &str = "artifacts";

#[derive(Default)]
struct Calls {
    gets: AtomicUsize,
    heads: AtomicUsize,
    puts: AtomicUsize,
}

struct CountingStore {
    inner: ObjectStoreBlobStore,
    calls: Calls,
}

impl CountingStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ObjectStoreBlobStore::memory(),
            calls: Calls::default(),
        })
    }

    async fn seed(&self, key: &str, data: Vec<u8>, encryption: Option<&str>) {
        self.inner
            .put(
                &ObjectLocation::new(BUCKET, key),
                Bytes::from(data),
                PutRequest {
                    content_type: None,
                    encryption: encryption.map(str::to_string),
                },
            )
            .await
            .unwrap();
    }

    fn gets(&self) -> usize {
        self.calls.gets.load(Ordering::SeqCst)
    }

    fn puts(&self) -> usize {
        self.calls.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for CountingStore {
    async fn get(&self, location: &ObjectLocation) -> StoreResult<FetchedObject> {
        self.calls.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(location).await
    }

    async fn head(&self, location: &ObjectLocation) -> StoreResult<ObjectHead> {
        self.calls.heads.fetch_add(1, Ordering::SeqCst);
        self.inner.head(location).await
    }

    async fn put(
        &self,
        location: &ObjectLocation,
        bytes: Bytes,
        request: PutRequest,
    ) -> StoreResult<()> {
        self.calls.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(location, bytes, request).await
    }
}

/// Holds back every fetch of one key and records the order fetches finish in.
struct DelayedStore {
    inner: Arc<CountingStore>,
    slow_key: String,
    delay: Duration,
    completed: Mutex<Vec<String>>,
}

impl DelayedStore {
    fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for DelayedStore {
    async fn get(&self, location: &ObjectLocation) -> StoreResult<FetchedObject> {
        if location.key == self.slow_key {
            tokio::time::sleep(self.delay).await;
        }
        let fetched = self.inner.get(location).await;
        self.completed.lock().unwrap().push(location.key.clone());
        fetched
    }

    async fn head(&self, location: &ObjectLocation) -> StoreResult<ObjectHead> {
        self.inner.head(location).await
    }

    async fn put(
        &self,
        location: &ObjectLocation,
        bytes: Bytes,
        request: PutRequest,
    ) -> StoreResult<()> {
        self.inner.put(location, bytes, request).await
    }
}

fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (path, data) in entries {
        writer.start_file(*path, SimpleFileOptions::default()).unwrap();
        writer.write_all(data.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn tar_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, *path, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn bzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn input(key: &str, name: &str) -> ArtifactRef {
    ArtifactRef::new(ObjectLocation::new(BUCKET, key), name)
}

fn output() -> ObjectLocation {
    ObjectLocation::new(BUCKET, "merged.zip")
}

fn request(inputs: Vec<ArtifactRef>, options: MergeOptions) -> MergeRequest {
    MergeRequest {
        inputs,
        output: output(),
        options,
    }
}

async fn read_output(store: &CountingStore) -> (Vec<(String, String)>, Option<String>) {
    let fetched = store.inner.get(&output()).await.unwrap();
    let mut archive = ZipArchive::new(Cursor::new(fetched.bytes)).unwrap();
    let entries = (0..archive.len())
        .map(|i| {
            let mut file = archive.by_index(i).unwrap();
            let mut content = String::new();
            file.read_to_string(&mut content).unwrap();
            (file.name().to_string(), content)
        })
        .collect();
    (entries, fetched.encryption)
}

fn names(entries: &[(String, String)]) -> Vec<&str> {
    entries.iter().map(|(p, _)| p.as_str()).collect()
}

#[tokio::test]
async fn test_zero_inputs_succeed_without_store_write() {
    let store = CountingStore::new();
    let pipeline = MergePipeline::new(store.clone());

    let report = pipeline
        .run(request(Vec::new(), MergeOptions::default()))
        .await
        .unwrap();

    assert_eq!(report, RunReport::NothingToMerge);
    assert_eq!(store.gets(), 0);
    assert_eq!(store.puts(), 0);
}

#[tokio::test]
async fn test_zip_and_tar_family_inputs_merge_in_declared_order() {
    let store = CountingStore::new();
    store.seed("a.zip", zip_of(&[("f1", "zip")]), None).await;
    store
        .seed("b.tgz", gzip(&tar_of(&[("f2", "tgz")])), None)
        .await;
    store
        .seed("c.tar.bz2", bzip(&tar_of(&[("f3", "bz2")])), None)
        .await;
    store.seed("d.tar", tar_of(&[("f4", "tar")]), None).await;

    let staging_dir = tempfile::tempdir().unwrap();
    let pipeline =
        MergePipeline::new(store.clone()).with_staging(StagingArea::in_dir(staging_dir.path()));

    let report = pipeline
        .run(request(
            vec![
                input("a.zip", "a"),
                input("b.tgz", "b"),
                input("c.tar.bz2", "c"),
                input("d.tar", "d"),
            ],
            MergeOptions {
                subfolder: true,
                revisions: false,
            },
        ))
        .await
        .unwrap();

    match report {
        RunReport::Merged { artifacts, .. } => assert_eq!(artifacts, 4),
        other => panic!("unexpected report: {other:?}"),
    }
    assert_eq!(store.puts(), 1);

    let (entries, _) = read_output(&store).await;
    assert_eq!(
        names(&entries),
        vec!["a/", "a/f1", "b/", "b/f2", "c/", "c/f3", "d/", "d/f4"]
    );
    assert!(entries.contains(&("c/f3".to_string(), "bz2".to_string())));
    assert_eq!(
        std::fs::read_dir(staging_dir.path()).unwrap().count(),
        0,
        "staging files must not outlive the run"
    );
}

#[tokio::test]
async fn test_non_tar_suffix_is_loaded_as_zip() {
    let store = CountingStore::new();
    // A tar under a non-tar-family key goes straight to the zip loader.
    store.seed("a.out", tar_of(&[("f1", "1")]), None).await;

    let err = MergePipeline::new(store.clone())
        .run(request(vec![input("a.out", "a")], MergeOptions::default()))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Merge);
    assert_eq!(store.puts(), 0);
}

#[tokio::test]
async fn test_missing_input_aborts_without_write() {
    let store = CountingStore::new();
    store.seed("a.zip", zip_of(&[("f1", "1")]), None).await;

    let err = MergePipeline::new(store.clone())
        .run(request(
            vec![input("a.zip", "a"), input("gone.zip", "b")],
            MergeOptions::default(),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Retrieval(_)));
    assert_eq!(err.class(), ErrorClass::Retrieval);
    assert_eq!(store.puts(), 0);
}

#[tokio::test]
async fn test_encryption_first_declared_by_default() {
    let store = CountingStore::new();
    store.seed("a.zip", zip_of(&[("f1", "1")]), None).await;
    store
        .seed("b.zip", zip_of(&[("f2", "2")]), Some("aws:kms"))
        .await;
    store
        .seed("c.zip", zip_of(&[("f3", "3")]), Some("AES256"))
        .await;

    let report = MergePipeline::new(store.clone())
        .run(request(
            vec![
                input("a.zip", "a"),
                input("b.zip", "b"),
                input("c.zip", "c"),
            ],
            MergeOptions::default(),
        ))
        .await
        .unwrap();

    match report {
        RunReport::Merged { encryption, .. } => assert_eq!(encryption.as_deref(), Some("aws:kms")),
        other => panic!("unexpected report: {other:?}"),
    }
    let (_, encryption) = read_output(&store).await;
    assert_eq!(encryption.as_deref(), Some("aws:kms"));
}

#[tokio::test]
async fn test_encryption_last_declared_and_uniform() {
    let store = CountingStore::new();
    store
        .seed("a.zip", zip_of(&[("f1", "1")]), Some("aws:kms"))
        .await;
    store
        .seed("b.zip", zip_of(&[("f2", "2")]), Some("AES256"))
        .await;
    let inputs = || vec![input("a.zip", "a"), input("b.zip", "b")];

    MergePipeline::new(store.clone())
        .with_policy(EncryptionPolicy::LastDeclared)
        .run(request(inputs(), MergeOptions::default()))
        .await
        .unwrap();
    let (_, encryption) = read_output(&store).await;
    assert_eq!(encryption.as_deref(), Some("AES256"));

    let puts_before = store.puts();
    let err = MergePipeline::new(store.clone())
        .with_policy(EncryptionPolicy::RequireUniform)
        .run(request(inputs(), MergeOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EncryptionConflict(_)));
    assert_eq!(err.class(), ErrorClass::Store);
    assert_eq!(store.puts(), puts_before);
}

#[tokio::test]
async fn test_no_encryption_observed_uses_store_default() {
    let store = CountingStore::new();
    store.seed("a.zip", zip_of(&[("f1", "1")]), None).await;

    MergePipeline::new(store.clone())
        .run(request(vec![input("a.zip", "a")], MergeOptions::default()))
        .await
        .unwrap();

    let (_, encryption) = read_output(&store).await;
    assert!(encryption.is_none());
}

fn job_event(parameters: &str, inputs: &[(&str, &str)], with_output: bool) -> JobEvent {
    let artifacts: Vec<_> = inputs
        .iter()
        .map(|(name, key)| {
            serde_json::json!({
                "name": name,
                "revision": format!("rev-{}", name),
                "location": { "type": "S3", "s3Location": { "bucketName": BUCKET, "objectKey": key } }
            })
        })
        .collect();
    let outputs = if with_output {
        serde_json::json!([{
            "name": "Merged",
            "location": { "type": "S3", "s3Location": { "bucketName": BUCKET, "objectKey": "merged.zip" } }
        }])
    } else {
        serde_json::json!([])
    };
    let event = serde_json::json!({
        "CodePipeline.job": {
            "id": "job-42",
            "data": {
                "actionConfiguration": { "configuration": { "UserParameters": parameters } },
                "inputArtifacts": artifacts,
                "outputArtifacts": outputs
            }
        }
    });
    JobEvent::from_json(&event.to_string()).unwrap()
}

#[tokio::test]
async fn test_job_success_with_revision_markers() {
    let store = CountingStore::new();
    store.seed("a.zip", zip_of(&[("f1", "1")]), None).await;
    let pipeline = MergePipeline::new(store.clone());

    let outcome = run_job(
        &pipeline,
        job_event(r#"{"revisions": true}"#, &[("A", "a.zip")], true),
    )
    .await;

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(outcome.message(), "Merged artifacts successfully.");
    assert_eq!(outcome.exit_code(), 0);

    let (entries, _) = read_output(&store).await;
    assert!(entries.contains(&(".revision-id-A".to_string(), "rev-A".to_string())));
}

#[tokio::test]
async fn test_job_without_inputs_reports_nothing_to_merge() {
    let store = CountingStore::new();
    let pipeline = MergePipeline::new(store.clone());

    let outcome = run_job(&pipeline, job_event("", &[], true)).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.message(), "No artifacts found. Nothing to merge.");
    assert_eq!(store.puts(), 0);
}

#[tokio::test]
async fn test_job_malformed_parameters_fail_before_any_fetch() {
    let store = CountingStore::new();
    store.seed("a.zip", zip_of(&[("f1", "1")]), None).await;
    let pipeline = MergePipeline::new(store.clone());

    let outcome = run_job(
        &pipeline,
        job_event(r#"{ "subfolder": true} }"#, &[("A", "a.zip")], true),
    )
    .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.message(), "Invalid JSON input error");
    assert_eq!(outcome.exit_code(), ErrorClass::Config.exit_code());
    assert_eq!(store.gets(), 0);
}

#[tokio::test]
async fn test_job_without_output_fails_before_any_fetch() {
    let store = CountingStore::new();
    store.seed("a.zip", zip_of(&[("f1", "1")]), None).await;
    let pipeline = MergePipeline::new(store.clone());

    let outcome = run_job(&pipeline, job_event("", &[("A", "a.zip")], false)).await;

    assert_eq!(outcome.message(), "No output artifact configured.");
    assert_eq!(store.gets(), 0);
    assert_eq!(store.calls.heads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_job_corrupt_input_reports_load_failure() {
    let store = CountingStore::new();
    store.seed("a.zip", b"not a zip".to_vec(), None).await;
    let pipeline = MergePipeline::new(store.clone());

    let outcome = run_job(&pipeline, job_event("", &[("A", "a.zip")], true)).await;

    assert_eq!(outcome.message(), "Failed to load zipped artifact.");
    assert_eq!(store.puts(), 0);
}

#[tokio::test]
async fn test_output_follows_declared_order_not_fetch_completion() {
    let counting = CountingStore::new();
    counting
        .seed("a.zip", zip_of(&[("x", "from a"), ("only-a", "a")]), Some("aws:kms"))
        .await;
    counting
        .seed("b.zip", zip_of(&[("x", "from b"), ("only-b", "b")]), Some("AES256"))
        .await;

    let store = Arc::new(DelayedStore {
        inner: counting.clone(),
        slow_key: "a.zip".to_string(),
        delay: Duration::from_millis(50),
        completed: Mutex::new(Vec::new()),
    });
    let pipeline = MergePipeline::new(store.clone());

    let report = pipeline
        .run(request(
            vec![
                input("a.zip", "a").with_revision("rev-a"),
                input("b.zip", "b").with_revision("rev-b"),
            ],
            MergeOptions {
                subfolder: false,
                revisions: true,
            },
        ))
        .await
        .unwrap();

    // The first declared input finished fetching last.
    assert_eq!(store.completed(), vec!["b.zip", "a.zip"]);

    let (entries, encryption) = read_output(&counting).await;
    assert_eq!(
        names(&entries),
        vec![".revision-id-a", "x", "only-a", ".revision-id-b", "only-b"]
    );
    assert_eq!(entries[1].1, "from b");
    assert_eq!(entries[0].1, "rev-a");
    assert_eq!(encryption.as_deref(), Some("aws:kms"));
    match report {
        RunReport::Merged { encryption, .. } => assert_eq!(encryption.as_deref(), Some("aws:kms")),
        other => panic!("unexpected report: {other:?}"),
    }
}
