//! End-to-end pipeline tests: ingest → annotate → embed → retrieve → answer,
//! all in-process against a temp SQLite database, with deterministic
//! embedding and completion providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use threatscope::catalog::load_catalog;
use threatscope::config::{
    CatalogConfig, ChunkingConfig, Config, DbConfig, EmbeddingConfig, GenerationConfig,
    IngestConfig, MapperConfig, RetrievalConfig,
};
use threatscope::db;
use threatscope::embedding::{DisabledProvider, EmbeddingProvider};
use threatscope::error::Result as TsResult;
use threatscope::error::ThreatScopeError;
use threatscope::generate::{answer_question, AnalysisMode, CompletionProvider, Generator};
use threatscope::index::{QueryFilter, VectorIndex};
use threatscope::ingest::IngestPipeline;
use threatscope::ioc::IocExtractor;
use threatscope::migrate;
use threatscope::models::{DocFormat, EmbeddingRecord, IocType};
use threatscope::retrieve::Retriever;
use threatscope::store::Store;
use threatscope::techniques::TechniqueMapper;

const CATALOG_TOML: &str = r#"
[[techniques]]
id = "T1059.001"
name = "PowerShell"
tactic = "Execution"
triggers = ["powershell"]

[[techniques]]
id = "T1566"
name = "Phishing"
tactic = "Initial Access"
triggers = ["phishing"]

[[techniques]]
id = "T1110"
name = "Brute Force"
tactic = "Credential Access"
triggers = ["brute force", "failed login"]
"#;

/// Embedder mapping a few keywords onto fixed orthogonal axes, so expected
/// similarities are exact and reproducible.
struct AxisEmbedder;

fn axis_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v = vec![0.0f32; 4];
    if lower.contains("powershell") {
        v[0] = 1.0;
    }
    if lower.contains("phishing") {
        v[1] = 1.0;
    }
    if lower.contains("ransomware") {
        v[2] = 1.0;
    }
    v[3] = 0.1;
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

#[async_trait]
impl EmbeddingProvider for AxisEmbedder {
    fn model_name(&self) -> &str {
        "axis-test"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed(&self, texts: &[String]) -> TsResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| axis_vector(t)).collect())
    }
}

/// Same vectors as [`AxisEmbedder`] under a different model name, to force
/// a model-identity mismatch against a stored index.
struct RenamedEmbedder;

#[async_trait]
impl EmbeddingProvider for RenamedEmbedder {
    fn model_name(&self) -> &str {
        "other-model"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed(&self, texts: &[String]) -> TsResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| axis_vector(t)).collect())
    }
}

/// Completion that cites the last chunk marker in the prompt. The prompt
/// template itself contains an example marker, so the last occurrence is
/// the one from the rendered context.
struct EchoCiting;

#[async_trait]
impl CompletionProvider for EchoCiting {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn complete(&self, prompt: &str) -> TsResult<String> {
        let citation = prompt
            .rfind("[chunk:")
            .map(|start| {
                let rest = &prompt[start..];
                let end = rest.find(']').unwrap() + 1;
                rest[..end].to_string()
            })
            .unwrap_or_default();
        Ok(format!(
            "The attacker executed encoded PowerShell {}.",
            citation
        ))
    }
}

/// Completion that invents a citation that cannot exist in the corpus.
struct CannedCompletion;

#[async_trait]
impl CompletionProvider for CannedCompletion {
    fn model_name(&self) -> &str {
        "canned"
    }
    async fn complete(&self, _prompt: &str) -> TsResult<String> {
        Ok("Likely lateral movement [chunk:bogus].".to_string())
    }
}

fn test_config(root: &std::path::Path) -> Config {
    std::fs::create_dir_all(root.join("data")).unwrap();
    std::fs::write(root.join("data/techniques.toml"), CATALOG_TOML).unwrap();
    Config {
        db: DbConfig {
            path: root.join("data/threatscope.db"),
        },
        catalog: CatalogConfig {
            path: root.join("data/techniques.toml"),
        },
        chunking: ChunkingConfig::default(),
        mapper: MapperConfig::default(),
        retrieval: RetrievalConfig::default(),
        embedding: EmbeddingConfig::default(),
        generation: GenerationConfig::default(),
        ingest: IngestConfig::default(),
    }
}

async fn setup() -> (TempDir, Config, sqlx::SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, config, pool)
}

fn make_pipeline(
    config: &Config,
    pool: &sqlx::SqlitePool,
    embedder: Arc<dyn EmbeddingProvider>,
) -> IngestPipeline {
    let catalog = load_catalog(&config.catalog.path).unwrap();
    let mapper = TechniqueMapper::new(&catalog, config.mapper.clone()).unwrap();
    let extractor = IocExtractor::new().unwrap();
    IngestPipeline::new(
        Store::new(pool.clone()),
        mapper,
        extractor,
        embedder,
        config.chunking.clone(),
        Duration::from_secs(30),
    )
}

fn make_retriever(
    config: &Config,
    pool: &sqlx::SqlitePool,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Retriever {
    let catalog = load_catalog(&config.catalog.path).unwrap();
    let mapper = Arc::new(TechniqueMapper::new(&catalog, config.mapper.clone()).unwrap());
    let extractor = Arc::new(IocExtractor::new().unwrap());
    Retriever::new(
        Store::new(pool.clone()),
        VectorIndex::new(pool.clone()),
        mapper,
        extractor,
        embedder,
        config.retrieval.clone(),
    )
}

#[tokio::test]
async fn test_ingest_annotates_extracts_and_embeds() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(AxisEmbedder));
    let store = Store::new(pool.clone());

    let report = pipeline
        .ingest_bytes(
            "file:///reports/r1.txt",
            Some("r1".to_string()),
            b"Attackers launched powershell -enc payloads from 185.220.101[.]4 last night.",
            DocFormat::Txt,
        )
        .await
        .unwrap();

    assert!(!report.skipped);
    assert_eq!(report.chunks, 1);
    assert_eq!(report.embedded, 1);
    assert!(report.techniques >= 1);
    assert!(report.iocs >= 1);

    let chunks = store.get_chunks(&report.document_id).await.unwrap();
    assert_eq!(chunks.len(), 1);

    let annotations = store.annotations_for_chunk(&chunks[0].id).await.unwrap();
    assert!(
        annotations.iter().any(|a| a.technique_id == "T1059.001"),
        "expected a PowerShell annotation, got {:?}",
        annotations
    );

    // The defanged IP is stored in its canonical refanged form.
    let ips = store.list_iocs(Some(IocType::Ip)).await.unwrap();
    assert!(ips.iter().any(|i| i.value == "185.220.101.4"));

    let index = VectorIndex::new(pool.clone());
    assert_eq!(index.count("axis-test").await.unwrap(), 1);
}

#[tokio::test]
async fn test_reingest_unchanged_skips_changed_replaces() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(AxisEmbedder));
    let store = Store::new(pool.clone());

    let first = pipeline
        .ingest_bytes(
            "file:///reports/r1.txt",
            Some("r1".to_string()),
            b"Initial phishing report draft.",
            DocFormat::Txt,
        )
        .await
        .unwrap();
    assert!(!first.skipped);

    let second = pipeline
        .ingest_bytes(
            "file:///reports/r1.txt",
            Some("r1".to_string()),
            b"Initial phishing report draft.",
            DocFormat::Txt,
        )
        .await
        .unwrap();
    assert!(second.skipped);
    assert_eq!(second.document_id, first.document_id);
    assert_eq!(store.count_documents().await.unwrap(), 1);

    let third = pipeline
        .ingest_bytes(
            "file:///reports/r1.txt",
            Some("r1".to_string()),
            b"Revised report: encoded powershell execution confirmed.",
            DocFormat::Txt,
        )
        .await
        .unwrap();
    assert!(!third.skipped);
    assert_eq!(third.document_id, first.document_id);
    assert_eq!(store.count_documents().await.unwrap(), 1);
    assert_eq!(store.count_chunks().await.unwrap(), 1);

    let chunks = store.get_chunks(&first.document_id).await.unwrap();
    assert!(chunks[0].text.contains("powershell"));
    let annotations = store.annotations_for_chunk(&chunks[0].id).await.unwrap();
    assert!(annotations.iter().any(|a| a.technique_id == "T1059.001"));
    assert!(!annotations.iter().any(|a| a.technique_id == "T1566"));
}

#[tokio::test]
async fn test_failed_document_does_not_abort_batch() {
    let (tmp, config, pool) = setup().await;
    let reports_dir = tmp.path().join("reports");
    std::fs::create_dir_all(&reports_dir).unwrap();
    std::fs::write(reports_dir.join("good.txt"), "Routine powershell audit.").unwrap();
    std::fs::write(reports_dir.join("bad.pdf"), b"%PDF-1.4\nnot actually a pdf").unwrap();

    let files = threatscope::loader::scan_paths(&[reports_dir], &config.ingest).unwrap();
    assert_eq!(files.len(), 2);

    let pipeline = Arc::new(make_pipeline(&config, &pool, Arc::new(AxisEmbedder)));
    let summary = pipeline.ingest_many(files, 2).await;

    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].0.contains("bad.pdf"));

    let store = Store::new(pool.clone());
    assert_eq!(store.count_documents().await.unwrap(), 1);
}

#[tokio::test]
async fn test_retrieve_ranks_and_applies_similarity_floor() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(AxisEmbedder));

    for (name, body) in [
        ("a.txt", "Attackers launched powershell payloads overnight."),
        ("b.txt", "A phishing lure delivered the first stage."),
        ("c.txt", "Routine maintenance window completed without issues."),
    ] {
        pipeline
            .ingest_bytes(
                &format!("file:///reports/{}", name),
                None,
                body.as_bytes(),
                DocFormat::Txt,
            )
            .await
            .unwrap();
    }

    let retriever = make_retriever(&config, &pool, Arc::new(AxisEmbedder));
    let hits = retriever
        .retrieve("powershell activity", 3, &QueryFilter::default())
        .await
        .unwrap();

    // Only the powershell document clears the 0.25 similarity floor.
    assert_eq!(hits.len(), 1);
    assert!(hits[0].chunk.text.contains("powershell"));
    assert!(hits[0].similarity > 0.99);
    assert!(hits[0].score >= hits[0].similarity);
    assert!(hits[0].score <= 1.0);
}

#[tokio::test]
async fn test_technique_filter_restricts_candidates() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(AxisEmbedder));

    let power = pipeline
        .ingest_bytes(
            "file:///reports/power.txt",
            None,
            b"Attackers launched powershell payloads overnight.",
            DocFormat::Txt,
        )
        .await
        .unwrap();
    let phish = pipeline
        .ingest_bytes(
            "file:///reports/phish.txt",
            None,
            b"A phishing lure delivered the first stage.",
            DocFormat::Txt,
        )
        .await
        .unwrap();

    let retriever = make_retriever(&config, &pool, Arc::new(AxisEmbedder));

    let unfiltered = retriever
        .retrieve(
            "powershell phishing investigation",
            5,
            &QueryFilter::default(),
        )
        .await
        .unwrap();
    assert_eq!(unfiltered.len(), 2);

    let filter = QueryFilter {
        technique_ids: vec!["T1566".to_string()],
        ..QueryFilter::default()
    };
    let filtered = retriever
        .retrieve("powershell phishing investigation", 5, &filter)
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].chunk.document_id, phish.document_id);
    assert_ne!(filtered[0].chunk.document_id, power.document_id);
}

#[tokio::test]
async fn test_ioc_type_filter_restricts_candidates() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(AxisEmbedder));

    let with_ip = pipeline
        .ingest_bytes(
            "file:///reports/ip.txt",
            None,
            b"Beaconing powershell implant reached 10.9.8.7 repeatedly.",
            DocFormat::Txt,
        )
        .await
        .unwrap();
    pipeline
        .ingest_bytes(
            "file:///reports/domain.txt",
            None,
            b"A phishing page at portal-login.example.net harvested credentials.",
            DocFormat::Txt,
        )
        .await
        .unwrap();

    let retriever = make_retriever(&config, &pool, Arc::new(AxisEmbedder));
    let filter = QueryFilter {
        ioc_types: vec![IocType::Ip],
        ..QueryFilter::default()
    };
    let hits = retriever
        .retrieve("powershell phishing traffic", 5, &filter)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.document_id, with_ip.document_id);
}

#[tokio::test]
async fn test_delete_cascades_but_keeps_shared_iocs() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(AxisEmbedder));
    let store = Store::new(pool.clone());
    let index = VectorIndex::new(pool.clone());

    let first = pipeline
        .ingest_bytes(
            "file:///reports/one.txt",
            None,
            b"Dropper hash D41D8CD98F00B204E9800998ECF8427E seen with powershell.",
            DocFormat::Txt,
        )
        .await
        .unwrap();
    let second = pipeline
        .ingest_bytes(
            "file:///reports/two.txt",
            None,
            b"Second wave phishing delivered d41d8cd98f00b204e9800998ecf8427e again.",
            DocFormat::Txt,
        )
        .await
        .unwrap();

    // One canonical (lowercase) hash indicator, sighted in both documents.
    let hashes = store.list_iocs(Some(IocType::Hash)).await.unwrap();
    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes[0].value, "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(hashes[0].chunk_ids.len(), 2);

    assert!(store.delete_document(&first.document_id).await.unwrap());

    assert!(store
        .get_document(&first.document_id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(index.count("axis-test").await.unwrap(), 1);

    let hashes = store.list_iocs(Some(IocType::Hash)).await.unwrap();
    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes[0].chunk_ids.len(), 1);

    let remaining = store.get_chunks(&second.document_id).await.unwrap();
    assert!(hashes[0].chunk_ids.contains(&remaining[0].id));
}

#[tokio::test]
async fn test_ask_grounds_answer_with_citations() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(AxisEmbedder));

    let report = pipeline
        .ingest_bytes(
            "file:///reports/ir.txt",
            None,
            b"Encoded powershell commands executed on host seven at 02:14.",
            DocFormat::Txt,
        )
        .await
        .unwrap();

    let retriever = make_retriever(&config, &pool, Arc::new(AxisEmbedder));
    let generator = Generator::new(Arc::new(EchoCiting), &GenerationConfig::default()).unwrap();

    let answer = answer_question(
        &retriever,
        &generator,
        "what powershell activity occurred?",
        AnalysisMode::IncidentResponse,
        3,
        &QueryFilter::default(),
    )
    .await
    .unwrap();

    assert!(answer.grounded);
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citations[0].document_id, report.document_id);
    assert!(answer.text.contains("[chunk:"));
    assert!(answer.retrieval_note.is_none());
}

#[tokio::test]
async fn test_ask_empty_corpus_yields_ungrounded_answer() {
    let (_tmp, config, pool) = setup().await;

    let retriever = make_retriever(&config, &pool, Arc::new(AxisEmbedder));
    let generator =
        Generator::new(Arc::new(CannedCompletion), &GenerationConfig::default()).unwrap();

    let answer = answer_question(
        &retriever,
        &generator,
        "what happened?",
        AnalysisMode::Hybrid,
        3,
        &QueryFilter::default(),
    )
    .await
    .unwrap();

    // The invented citation refers to nothing retrieved, so it is dropped
    // and the answer is labeled ungrounded.
    assert!(!answer.grounded);
    assert!(answer.citations.is_empty());
    assert!(answer.text.starts_with("Note:"));
}

#[tokio::test]
async fn test_model_identity_mismatch_is_reported() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(AxisEmbedder));
    pipeline
        .ingest_bytes(
            "file:///reports/r.txt",
            None,
            b"powershell activity recorded",
            DocFormat::Txt,
        )
        .await
        .unwrap();

    let retriever = make_retriever(&config, &pool, Arc::new(RenamedEmbedder));
    let err = retriever
        .retrieve("powershell", 3, &QueryFilter::default())
        .await
        .unwrap_err();

    match err {
        ThreatScopeError::Config(msg) => {
            assert!(msg.contains("rebuild"), "unexpected message: {}", msg)
        }
        other => panic!("expected Config error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_overlapping_windows_of_one_document_are_collapsed() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(AxisEmbedder));
    let store = Store::new(pool.clone());

    let body = "Encoded powershell commands executed on host seven. ".repeat(40);
    let report = pipeline
        .ingest_bytes(
            "file:///reports/long.txt",
            None,
            body.as_bytes(),
            DocFormat::Txt,
        )
        .await
        .unwrap();
    assert!(report.chunks > 1);
    assert_eq!(
        store.get_chunks(&report.document_id).await.unwrap().len(),
        report.chunks
    );

    let retriever = make_retriever(&config, &pool, Arc::new(AxisEmbedder));
    let hits = retriever
        .retrieve("powershell commands", 5, &QueryFilter::default())
        .await
        .unwrap();

    // Every window scores identically; near-duplicates collapse to one.
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn test_disabled_embedding_leaves_chunks_pending_then_backfills() {
    let (_tmp, config, pool) = setup().await;
    let pipeline = make_pipeline(&config, &pool, Arc::new(DisabledProvider));
    let store = Store::new(pool.clone());
    let index = VectorIndex::new(pool.clone());

    let report = pipeline
        .ingest_bytes(
            "file:///reports/r.txt",
            None,
            b"powershell activity recorded on host three",
            DocFormat::Txt,
        )
        .await
        .unwrap();
    assert_eq!(report.embedded, 0);
    assert_eq!(report.chunks, 1);
    assert_eq!(index.count("axis-test").await.unwrap(), 0);

    // Backfill the pending chunks with a real provider, as `embed pending`
    // would.
    let embedder = AxisEmbedder;
    let chunks = store.get_chunks(&report.document_id).await.unwrap();
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed(&texts).await.unwrap();
    let records: Vec<EmbeddingRecord> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| EmbeddingRecord {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            model: embedder.model_name().to_string(),
            dims: embedder.dims(),
            vector,
            hash: chunk.hash.clone(),
        })
        .collect();
    index.upsert_batch(&records).await.unwrap();

    assert_eq!(index.count("axis-test").await.unwrap(), 1);
    let retriever = make_retriever(&config, &pool, Arc::new(AxisEmbedder));
    let hits = retriever
        .retrieve("powershell", 3, &QueryFilter::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
}
