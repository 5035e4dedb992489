//! Grounded answer generation.
//!
//! [`Generator::answer`] runs a small state machine: compose the prompt
//! from retrieved chunks, invoke the completion model under a deadline,
//! then validate grounding by checking every `[chunk:id]` citation against
//! the retrieved set. Failures are typed and final; the generator never
//! returns a partial answer alongside an error.
//!
//! Answers that cite nothing (or were produced without any retrieved
//! context) are labeled ungrounded and carry a disclaimer prefix instead
//! of fabricated citations.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::chunk::floor_char_boundary;
use crate::config::{Config, GenerationConfig};
use crate::error::{Result, ThreatScopeError};
use crate::index::QueryFilter;
use crate::models::{Citation, IocType};
use crate::retrieve::{RetrievedChunk, Retriever};

// ============ Analysis modes ============

/// Prompting stance, picked explicitly or detected from the input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    IncidentResponse,
    ThreatIntel,
    Hybrid,
}

/// Phrases that read like live incident telemetry.
const IR_SIGNALS: &[&str] = &[
    "failed login",
    "login failure",
    "connection attempt",
    "nc -e",
    "outbound traffic",
    "/tmp/",
    "bruteforce",
    "event id",
    "auth.log",
    "syslog",
];

/// Phrases that read like finished intelligence reporting.
const TI_SIGNALS: &[&str] = &[
    "apt",
    "malware",
    "ttp",
    "mitre",
    "campaign",
    "threat actor",
    "phishing",
    "ransomware",
    "c2",
    "command and control",
];

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::IncidentResponse => "incident-response",
            AnalysisMode::ThreatIntel => "threat-intel",
            AnalysisMode::Hybrid => "hybrid",
        }
    }

    /// Pick a mode from the text itself. Only an unambiguous signal set
    /// selects a specialized mode; anything mixed or silent is hybrid.
    pub fn detect(text: &str) -> Self {
        let lower = text.to_lowercase();
        let tokens: BTreeSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let has = |signal: &str| -> bool {
            if signal.chars().all(|c| c.is_alphanumeric()) {
                tokens.contains(signal)
            } else {
                lower.contains(signal)
            }
        };

        let ir = IR_SIGNALS.iter().any(|s| has(s));
        let ti = TI_SIGNALS.iter().any(|s| has(s));

        match (ir, ti) {
            (true, false) => AnalysisMode::IncidentResponse,
            (false, true) => AnalysisMode::ThreatIntel,
            _ => AnalysisMode::Hybrid,
        }
    }
}

impl std::str::FromStr for AnalysisMode {
    type Err = ThreatScopeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ir" | "incident-response" | "incident_response" => Ok(AnalysisMode::IncidentResponse),
            "ti" | "intel" | "threat-intel" | "threat_intel" => Ok(AnalysisMode::ThreatIntel),
            "hybrid" => Ok(AnalysisMode::Hybrid),
            other => Err(ThreatScopeError::Config(format!(
                "unknown analysis mode '{}' (expected ir, intel, or hybrid)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Completion providers ============

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Placeholder used when generation is not configured.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionProvider for DisabledCompletion {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(ThreatScopeError::ModelUnavailable(
            "generation provider is disabled".to_string(),
        ))
    }
}

/// Local Ollama instance, `POST {url}/api/generate`.
pub struct OllamaCompletion {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaCompletion {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ThreatScopeError::Config("generation.model is required".to_string()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ThreatScopeError::Config(format!("http client: {}", e)))?;

        Ok(Self { model, url, client })
    }
}

#[async_trait]
impl CompletionProvider for OllamaCompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ThreatScopeError::ModelUnavailable(format!(
                    "ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ThreatScopeError::ModelUnavailable(format!(
                "ollama api error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response.json().await.map_err(|e| {
            ThreatScopeError::ModelUnavailable(format!("ollama response body: {}", e))
        })?;

        json.get("response")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ThreatScopeError::ModelUnavailable(
                    "ollama response missing 'response' field".to_string(),
                )
            })
    }
}

/// OpenAI chat completions API. Requires `OPENAI_API_KEY`.
pub struct OpenAICompletion {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAICompletion {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ThreatScopeError::Config("generation.model is required".to_string()))?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            ThreatScopeError::Config("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ThreatScopeError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            model,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.2,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ThreatScopeError::ModelUnavailable(format!("openai request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ThreatScopeError::ModelUnavailable(format!(
                "openai api error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response.json().await.map_err(|e| {
            ThreatScopeError::ModelUnavailable(format!("openai response body: {}", e))
        })?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ThreatScopeError::ModelUnavailable(
                    "openai response missing message content".to_string(),
                )
            })
    }
}

/// Instantiate the completion provider named by the configuration.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        "ollama" => Ok(Arc::new(OllamaCompletion::new(config)?)),
        "openai" => Ok(Arc::new(OpenAICompletion::new(config)?)),
        other => Err(ThreatScopeError::Config(format!(
            "unknown generation provider: {}",
            other
        ))),
    }
}

// ============ Prompt templates ============

const IR_TEMPLATE: &str = "You are an incident response analyst. Using only the context \
chunks below, answer the question about this incident. Cite every claim with the chunk \
marker it came from, e.g. [chunk:abc123]. Assess severity as High (active compromise, \
credential theft, or data exfiltration), Medium (suspicious activity needing containment), \
or Low (reconnaissance or policy noise), and recommend concrete next steps. If the context \
does not support an answer, say so plainly.";

const TI_TEMPLATE: &str = "You are a threat intelligence analyst. Using only the context \
chunks below, answer the question. Relate observed behavior to the referenced attack \
techniques, name indicators exactly as they appear, and cite every claim with the chunk \
marker it came from, e.g. [chunk:abc123]. If the context does not support an answer, say \
so plainly.";

const HYBRID_TEMPLATE: &str = "You are a security analyst. Using only the context chunks \
below, answer the question. Cover both what happened operationally and how it maps to \
known attack techniques. Cite every claim with the chunk marker it came from, e.g. \
[chunk:abc123]. If the context does not support an answer, say so plainly.";

const UNGROUNDED_DISCLAIMER: &str =
    "Note: this answer is not grounded in the ingested corpus and cites no evidence.";

// ============ Answer ============

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub grounded: bool,
    pub mode: AnalysisMode,
    /// Set when retrieval was degraded and the answer was produced without
    /// corpus context.
    pub retrieval_note: Option<String>,
}

// ============ Generator ============

enum GeneratorState {
    ComposePrompt,
    InvokeModel { prompt: String },
    ValidateGrounding { raw: String },
    Done(Answer),
    Failed(ThreatScopeError),
}

pub struct Generator {
    provider: Arc<dyn CompletionProvider>,
    max_context_chars: usize,
    timeout: Duration,
    prompt_dir: Option<PathBuf>,
    citation_re: Regex,
}

impl Generator {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: &GenerationConfig) -> Result<Self> {
        let citation_re = Regex::new(r"\[chunk:([A-Za-z0-9_-]+)\]")
            .map_err(|e| ThreatScopeError::Config(format!("citation pattern: {}", e)))?;

        Ok(Self {
            provider,
            max_context_chars: config.max_context_chars,
            timeout: Duration::from_secs(config.timeout_secs),
            prompt_dir: config.prompt_dir.clone(),
            citation_re,
        })
    }

    /// Produce a grounded answer, or a typed failure. Never both.
    pub async fn answer(
        &self,
        question: &str,
        mode: AnalysisMode,
        hits: &[RetrievedChunk],
    ) -> Result<Answer> {
        let mut state = GeneratorState::ComposePrompt;

        loop {
            state = match state {
                GeneratorState::ComposePrompt => {
                    let prompt = self.compose_prompt(question, mode, hits);
                    debug!(mode = %mode, prompt_chars = prompt.len(), "prompt composed");
                    GeneratorState::InvokeModel { prompt }
                }
                GeneratorState::InvokeModel { prompt } => {
                    match tokio::time::timeout(self.timeout, self.provider.complete(&prompt)).await
                    {
                        Err(_) => GeneratorState::Failed(ThreatScopeError::ModelTimeout(
                            self.timeout,
                        )),
                        Ok(Err(e)) => GeneratorState::Failed(e),
                        Ok(Ok(raw)) => {
                            debug!(response_chars = raw.len(), "model responded");
                            GeneratorState::ValidateGrounding { raw }
                        }
                    }
                }
                GeneratorState::ValidateGrounding { raw } => {
                    GeneratorState::Done(self.validate_grounding(mode, &raw, hits))
                }
                GeneratorState::Done(answer) => return Ok(answer),
                GeneratorState::Failed(e) => return Err(e),
            };
        }
    }

    fn template_for(&self, mode: AnalysisMode) -> String {
        if let Some(dir) = &self.prompt_dir {
            let name = match mode {
                AnalysisMode::IncidentResponse => "prompt_ir.txt",
                AnalysisMode::ThreatIntel => "prompt_intel.txt",
                AnalysisMode::Hybrid => "prompt_hybrid.txt",
            };
            match std::fs::read_to_string(dir.join(name)) {
                Ok(custom) => return custom,
                Err(e) => {
                    warn!(template = name, error = %e, "prompt template missing, using builtin");
                }
            }
        }
        match mode {
            AnalysisMode::IncidentResponse => IR_TEMPLATE.to_string(),
            AnalysisMode::ThreatIntel => TI_TEMPLATE.to_string(),
            AnalysisMode::Hybrid => HYBRID_TEMPLATE.to_string(),
        }
    }

    /// Build the prompt within the context budget. Hits enter in rank
    /// order; when the budget runs out the remaining (lower-ranked) ones
    /// are dropped. A first block too large on its own is truncated at a
    /// character boundary rather than dropped.
    fn compose_prompt(&self, question: &str, mode: AnalysisMode, hits: &[RetrievedChunk]) -> String {
        let mut context = String::new();
        let mut used = 0usize;

        for (i, hit) in hits.iter().enumerate() {
            let block = render_block(hit);
            if used + block.len() > self.max_context_chars {
                if i == 0 {
                    let cut = floor_char_boundary(&block, self.max_context_chars);
                    context.push_str(&block[..cut]);
                    context.push('\n');
                }
                break;
            }
            used += block.len();
            context.push_str(&block);
        }

        if context.is_empty() {
            context.push_str("(no grounding context available)\n");
        }

        format!(
            "{}\n\nContext:\n{}\nQuestion: {}\nAnswer:",
            self.template_for(mode),
            context,
            question
        )
    }

    /// Extract `[chunk:id]` citations, keep the ones that reference a
    /// retrieved chunk (first occurrence order, deduplicated), and label
    /// the answer ungrounded when none survive.
    fn validate_grounding(&self, mode: AnalysisMode, raw: &str, hits: &[RetrievedChunk]) -> Answer {
        let known: BTreeSet<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();

        let mut citations: Vec<Citation> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for capture in self.citation_re.captures_iter(raw) {
            let id = &capture[1];
            if !known.contains(id) || seen.contains(id) {
                continue;
            }
            if let Some(hit) = hits.iter().find(|h| h.chunk.id == id) {
                seen.insert(id.to_string());
                citations.push(Citation {
                    chunk_id: hit.chunk.id.clone(),
                    document_id: hit.chunk.document_id.clone(),
                    span_start: hit.chunk.span_start,
                    span_end: hit.chunk.span_end,
                });
            }
        }

        let grounded = !citations.is_empty();
        let text = if grounded {
            raw.trim().to_string()
        } else {
            format!("{}\n\n{}", UNGROUNDED_DISCLAIMER, raw.trim())
        };

        Answer {
            text,
            citations,
            grounded,
            mode,
            retrieval_note: None,
        }
    }
}

fn render_block(hit: &RetrievedChunk) -> String {
    let mut block = format!(
        "[chunk:{}] (source: {}, relevance: {:.2})\n{}\n",
        hit.chunk.id, hit.chunk.document_id, hit.score, hit.chunk.text
    );
    if !hit.techniques.is_empty() {
        let ids: Vec<&str> = hit
            .techniques
            .iter()
            .map(|t| t.technique_id.as_str())
            .collect();
        block.push_str(&format!("techniques: {}\n", ids.join(", ")));
    }
    if !hit.iocs.is_empty() {
        let values: Vec<String> = hit
            .iocs
            .iter()
            .map(|ioc| format!("{} {}", ioc.ioc_type, ioc.value))
            .collect();
        block.push_str(&format!("indicators: {}\n", values.join(", ")));
    }
    block.push('\n');
    block
}

/// Pull the first JSON object out of prose. Models asked for structured
/// output often wrap it in commentary.
pub fn extract_json_block(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

// ============ Orchestration ============

/// Answer a question against the corpus.
///
/// Retrieval failures from an unavailable embedding backend or storage
/// degrade to an ungrounded answer carrying a retrieval note.
/// Configuration and dimensionality errors propagate, as does any
/// generation failure.
pub async fn answer_question(
    retriever: &Retriever,
    generator: &Generator,
    question: &str,
    mode: AnalysisMode,
    k: usize,
    filter: &QueryFilter,
) -> Result<Answer> {
    let (hits, note) = match retriever.retrieve(question, k, filter).await {
        Ok(hits) => (hits, None),
        Err(e @ ThreatScopeError::EmbeddingUnavailable(_)) | Err(e @ ThreatScopeError::Store(_)) => {
            warn!(error = %e, "retrieval degraded, answering without corpus context");
            (Vec::new(), Some(format!("retrieval degraded: {}", e)))
        }
        Err(e) => return Err(e),
    };

    let mut answer = generator.answer(question, mode, &hits).await?;
    if answer.retrieval_note.is_none() {
        answer.retrieval_note = note;
    }
    Ok(answer)
}

/// CLI entry for `tscope ask`.
pub async fn run_ask(
    config: &Config,
    question: &str,
    mode: Option<AnalysisMode>,
    technique: Option<String>,
    ioc_type: Option<IocType>,
    k: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let retriever = Retriever::from_config(config, pool.clone())?;
    let provider = create_generator(&config.generation)?;
    let generator = Generator::new(provider, &config.generation)?;

    let mode = mode.unwrap_or_else(|| AnalysisMode::detect(question));
    let filter = QueryFilter {
        technique_ids: technique.into_iter().collect(),
        ioc_types: ioc_type.into_iter().collect(),
        min_score: None,
    };
    let k = k.unwrap_or(config.retrieval.final_k);

    let answer = answer_question(&retriever, &generator, question, mode, k, &filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        println!("{}", answer.text);
        println!();
        if answer.grounded {
            println!("citations:");
            for citation in &answer.citations {
                println!(
                    "  [chunk:{}] document {} span {}..{}",
                    citation.chunk_id, citation.document_id, citation.span_start, citation.span_end
                );
            }
        } else {
            println!("(ungrounded)");
        }
        if let Some(note) = &answer.retrieval_note {
            println!("note: {}", note);
        }
        println!("mode: {}", answer.mode);
    }

    pool.close().await;
    Ok(())
}

/// CLI entry for `tscope analyze`: one-shot analysis of a not-yet-ingested
/// report file. Maps techniques and extracts indicators locally, then asks
/// the model for an assessment grounded in the file's own chunks.
pub async fn run_analyze(
    config: &Config,
    file: &std::path::Path,
    mode: Option<AnalysisMode>,
    json: bool,
) -> anyhow::Result<()> {
    use crate::catalog;
    use crate::chunk::chunk_text;
    use crate::ioc::IocExtractor;
    use crate::normalize;
    use crate::techniques::TechniqueMapper;

    let bytes = std::fs::read(file)?;
    let format = normalize::detect_format(file, &bytes)?;
    let normalized = normalize::normalize(&bytes, format)?;

    let chunks = chunk_text("analysis", &normalized.text, &config.chunking)?;

    let catalog = catalog::load_catalog(&config.catalog.path)?;
    let mapper = TechniqueMapper::new(&catalog, config.mapper.clone())?;
    let extractor = IocExtractor::new()?;

    let mut annotations = Vec::new();
    for chunk in &chunks {
        annotations.extend(mapper.annotate_chunk(chunk));
    }
    let iocs = extractor.extract(&chunks).into_vec();

    let mode = mode.unwrap_or_else(|| AnalysisMode::detect(&normalized.text));

    println!("analyze {}", file.display());
    println!("  format: {}", format);
    println!("  chunks: {}", chunks.len());
    println!("  mode: {}", mode);

    let mut technique_ids: Vec<&str> = annotations
        .iter()
        .map(|a| a.technique_id.as_str())
        .collect();
    technique_ids.sort_unstable();
    technique_ids.dedup();
    println!("  techniques: {}", technique_ids.join(", "));
    println!("  iocs: {}", iocs.len());
    for ioc in &iocs {
        println!("    {} {} ({:.2})", ioc.ioc_type, ioc.value, ioc.confidence);
    }

    if config.generation.is_enabled() {
        let provider = create_generator(&config.generation)?;
        let generator = Generator::new(provider, &config.generation)?;

        // Ground the assessment in the file's own chunks.
        let hits: Vec<RetrievedChunk> = chunks
            .iter()
            .map(|chunk| RetrievedChunk {
                chunk: chunk.clone(),
                similarity: 1.0,
                score: 1.0,
                techniques: annotations
                    .iter()
                    .filter(|a| a.chunk_id == chunk.id)
                    .cloned()
                    .collect(),
                iocs: iocs
                    .iter()
                    .filter(|i| i.chunk_ids.contains(&chunk.id))
                    .cloned()
                    .collect(),
            })
            .collect();

        let question = "Summarize this report: what happened, which techniques are in play, \
and what should be done next?";
        let answer = generator.answer(question, mode, &hits).await?;

        if json {
            match extract_json_block(&answer.text) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("{}", serde_json::to_string_pretty(&answer)?),
            }
        } else {
            println!();
            println!("{}", answer.text);
        }
    } else if json {
        let summary = serde_json::json!({
            "file": file.display().to_string(),
            "format": format.as_str(),
            "mode": mode.as_str(),
            "chunks": chunks.len(),
            "techniques": technique_ids,
            "iocs": iocs,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    println!("ok");
    Ok(())
}
