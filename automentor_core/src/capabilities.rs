//! External capabilities
//!
//! Narrow trait seams for everything the agent does not own: embedding,
//! text generation, job search, resume rendering and calendar scheduling.
//! Embedding and generation calls always go through [`CapabilityGuard`],
//! which bounds each call with a timeout.
//!
//! Bundled implementations are deterministic and offline. Mock variants are
//! provided for tests (scripted, failing and slow).

use crate::agent::types::{
    CalendarEvent, JobFilters, JobPosting, RenderedDocument, ResumeRequest, ScheduleConfirmation,
};
use crate::error::{AgentError, AgentResult};
use crossbeam_channel::{bounded, RecvTimeoutError};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

// ============================================================
// CAPABILITY TRAITS
// ============================================================

pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> AgentResult<Vec<f32>>;
}

pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, max_tokens: usize) -> AgentResult<String>;
}

pub trait JobSearch: Send + Sync {
    fn search(&self, filters: &JobFilters) -> AgentResult<Vec<JobPosting>>;
}

pub trait ResumeRenderer: Send + Sync {
    fn render(&self, request: &ResumeRequest) -> AgentResult<RenderedDocument>;
}

pub trait CalendarScheduler: Send + Sync {
    fn schedule(&self, event: &CalendarEvent) -> AgentResult<ScheduleConfirmation>;
}

/// Tool capabilities the orchestrator dispatches reflection actions to
#[derive(Clone)]
pub struct ToolSet {
    pub job_search: Arc<dyn JobSearch>,
    pub resume_renderer: Arc<dyn ResumeRenderer>,
    pub calendar: Arc<dyn CalendarScheduler>,
}

impl Default for ToolSet {
    fn default() -> Self {
        Self {
            job_search: Arc::new(StaticJobBoard::new()),
            resume_renderer: Arc::new(PlainTextResumeRenderer),
            calendar: Arc::new(RecordingCalendar::new()),
        }
    }
}

// ============================================================
// TIMEOUT GUARD
// ============================================================

/// Runs capability calls on a worker thread and gives up after `timeout`.
///
/// A timed-out worker is abandoned; its late result is dropped with the
/// channel. Callers never observe partial results.
#[derive(Debug, Clone)]
pub struct CapabilityGuard {
    timeout: Duration,
}

impl CapabilityGuard {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn embed(&self, provider: &Arc<dyn EmbeddingProvider>, text: &str) -> AgentResult<Vec<f32>> {
        let provider = Arc::clone(provider);
        let text = text.to_string();
        self.run("embedding", AgentError::Embedding, move || provider.embed(&text))
    }

    pub fn generate(
        &self,
        generator: &Arc<dyn TextGenerator>,
        prompt: &str,
        max_tokens: usize,
    ) -> AgentResult<String> {
        let generator = Arc::clone(generator);
        let prompt = prompt.to_string();
        self.run("text_generation", AgentError::Generation, move || {
            generator.generate(&prompt, max_tokens)
        })
    }

    /// Bound an arbitrary tool call by the same timeout
    pub fn call_tool<T, F>(&self, tool: &'static str, call: F) -> AgentResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AgentResult<T> + Send + 'static,
    {
        self.run(
            tool,
            |message| AgentError::Tool {
                tool: tool.to_string(),
                message,
            },
            call,
        )
    }

    fn run<T, F, L>(&self, capability: &'static str, lost: L, call: F) -> AgentResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AgentResult<T> + Send + 'static,
        L: FnOnce(String) -> AgentError,
    {
        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name(format!("capability-{}", capability))
            .spawn(move || {
                let _ = tx.send(call());
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                log::warn!(
                    "[CAPABILITY] {} exceeded {}ms, abandoning call",
                    capability,
                    timeout_ms
                );
                Err(AgentError::CapabilityTimeout {
                    capability: capability.to_string(),
                    timeout_ms,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(lost(format!(
                "{} worker exited without a result",
                capability
            ))),
        }
    }
}

// ============================================================
// HASHING EMBEDDER
// ============================================================

/// Deterministic feature-hashing embedder
///
/// Unigrams and bigrams are hashed into `dim` signed buckets with SHA-256,
/// then the vector is L2-normalized. Identical text always embeds to the
/// identical vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn tokens(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut index = [0u8; 8];
        index.copy_from_slice(&digest[..8]);
        let slot = (u64::from_le_bytes(index) % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (slot, sign)
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn embed(&self, text: &str) -> AgentResult<Vec<f32>> {
        let tokens = Self::tokens(text);
        if tokens.is_empty() {
            return Err(AgentError::Embedding(
                "text has no embeddable tokens".to_string(),
            ));
        }

        let mut vector = vec![0.0f32; self.dim];
        for token in &tokens {
            let (slot, sign) = self.bucket(token);
            vector[slot] += sign;
        }
        for pair in tokens.windows(2) {
            let (slot, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[slot] += 0.5 * sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Err(AgentError::Embedding("degenerate embedding".to_string()));
        }
        vector.iter_mut().for_each(|x| *x /= norm);
        Ok(vector)
    }
}

// ============================================================
// BUNDLED TOOLS
// ============================================================

/// Small built-in job catalog, filtered by keyword and location
pub struct StaticJobBoard {
    postings: Vec<JobPosting>,
}

impl StaticJobBoard {
    pub fn new() -> Self {
        let posting = |id: &str, title: &str, company: &str, location: &str, skills: &[&str]| {
            JobPosting {
                id: id.to_string(),
                title: title.to_string(),
                company: company.to_string(),
                location: location.to_string(),
                remote: location.eq_ignore_ascii_case("remote"),
                skills: skills.iter().map(|s| s.to_string()).collect(),
            }
        };

        Self {
            postings: vec![
                posting("job_frontend_sr", "Senior Frontend Developer", "TechCorp Inc", "San Francisco, CA",
                    &["React", "TypeScript", "JavaScript", "CSS", "HTML"]),
                posting("job_ds_intern", "Data Science Intern", "Analytics Pro", "Remote",
                    &["Python", "SQL", "Statistics", "Pandas"]),
                posting("job_pm", "Product Manager", "Startup Dynamics", "Austin, TX",
                    &["Product Strategy", "Roadmapping", "User Research", "Analytics"]),
                posting("job_swe_jr", "Junior Software Engineer", "DevFirst Solutions", "New York, NY",
                    &["JavaScript", "Python", "Git", "React"]),
                posting("job_mle", "Machine Learning Engineer", "AI Innovations", "Seattle, WA",
                    &["Python", "Machine Learning", "TensorFlow", "AWS", "Docker"]),
                posting("job_ux", "UX Designer", "Design Studio", "Los Angeles, CA",
                    &["UI/UX Design", "Figma", "User Research", "Prototyping"]),
            ],
        }
    }

    fn matches(posting: &JobPosting, filters: &JobFilters) -> bool {
        let haystack = format!("{} {}", posting.title, posting.skills.join(" ")).to_lowercase();
        let keyword_hit = filters.keywords.is_empty()
            || filters
                .keywords
                .iter()
                .any(|k| haystack.contains(&k.to_lowercase()));
        if !keyword_hit {
            return false;
        }
        if filters.remote_only && !posting.remote {
            return false;
        }
        match &filters.location {
            Some(location) => {
                posting.remote || posting.location.to_lowercase().contains(&location.to_lowercase())
            }
            None => true,
        }
    }
}

impl Default for StaticJobBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSearch for StaticJobBoard {
    fn search(&self, filters: &JobFilters) -> AgentResult<Vec<JobPosting>> {
        let limit = if filters.limit == 0 { 5 } else { filters.limit };
        Ok(self
            .postings
            .iter()
            .filter(|p| Self::matches(p, filters))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Renders a plain-text resume with the section order of the named template
pub struct PlainTextResumeRenderer;

impl PlainTextResumeRenderer {
    pub const TEMPLATES: [&'static str; 3] = ["modern", "technical", "creative"];

    fn sections(template: &str) -> Option<&'static [&'static str]> {
        match template {
            "modern" => Some(&["summary", "experience", "skills", "projects"]),
            "technical" => Some(&["summary", "skills", "experience", "projects"]),
            "creative" => Some(&["summary", "experience", "projects", "skills"]),
            _ => None,
        }
    }
}

impl ResumeRenderer for PlainTextResumeRenderer {
    fn render(&self, request: &ResumeRequest) -> AgentResult<RenderedDocument> {
        let sections = Self::sections(&request.template).ok_or_else(|| AgentError::Tool {
            tool: "resume_renderer".to_string(),
            message: format!("unknown template '{}'", request.template),
        })?;

        let mut out = String::new();
        out.push_str(&format!("RESUME - {}\n", request.user_id));
        if let Some(role) = &request.target_role {
            out.push_str(&format!("Target role: {}\n", role));
        }
        for section in sections {
            out.push_str(&format!("\n## {}\n", section.to_uppercase()));
            if *section == "summary" {
                for line in &request.highlights {
                    out.push_str(&format!("- {}\n", line));
                }
            }
        }

        Ok(RenderedDocument {
            template: request.template.clone(),
            content: out,
        })
    }
}

/// In-process calendar that keeps every scheduled event
pub struct RecordingCalendar {
    events: Mutex<Vec<CalendarEvent>>,
}

impl RecordingCalendar {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for RecordingCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl CalendarScheduler for RecordingCalendar {
    fn schedule(&self, event: &CalendarEvent) -> AgentResult<ScheduleConfirmation> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(ScheduleConfirmation {
            event_id: Uuid::new_v4().to_string(),
            starts_at: event.starts_at,
        })
    }
}

// ============================================================
// MOCKS
// ============================================================

/// Scripted text generator
///
/// Pops queued responses in order, then falls back to `default_response`.
/// Can be told to fail the next N calls or to sleep before answering.
pub struct MockTextGenerator {
    responses: Mutex<VecDeque<String>>,
    default_response: String,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl MockTextGenerator {
    pub fn new(default_response: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: default_response.to_string(),
            failures_left: AtomicUsize::new(0),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_response(self, response: &str) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response.to_string());
        self
    }

    pub fn failing(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextGenerator for MockTextGenerator {
    fn generate(&self, _prompt: &str, _max_tokens: usize) -> AgentResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AgentError::Generation("mock generator failure".to_string()));
        }
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(next.unwrap_or_else(|| self.default_response.clone()))
    }
}

/// Hashing embedder that can be slowed down or made to fail
pub struct MockEmbedder {
    inner: HashingEmbedder,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            inner: HashingEmbedder::new(dim),
            failures_left: AtomicUsize::new(0),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for MockEmbedder {
    fn embed(&self, text: &str) -> AgentResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AgentError::Embedding("mock embedder failure".to_string()));
        }
        self.inner.embed(text)
    }
}

/// Tool that always fails, for exercising non-fatal dispatch
pub struct FailingTool;

impl FailingTool {
    fn fail<T>(tool: &str) -> AgentResult<T> {
        Err(AgentError::Tool {
            tool: tool.to_string(),
            message: "service unavailable".to_string(),
        })
    }
}

impl JobSearch for FailingTool {
    fn search(&self, _filters: &JobFilters) -> AgentResult<Vec<JobPosting>> {
        Self::fail("job_search")
    }
}

impl ResumeRenderer for FailingTool {
    fn render(&self, _request: &ResumeRequest) -> AgentResult<RenderedDocument> {
        Self::fail("resume_renderer")
    }
}

impl CalendarScheduler for FailingTool {
    fn schedule(&self, _event: &CalendarEvent) -> AgentResult<ScheduleConfirmation> {
        Self::fail("calendar")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Learn React hooks").unwrap();
        let b = embedder.embed("learn react HOOKS").unwrap();
        assert_eq!(a, b);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_embedder_rejects_empty() {
        let embedder = HashingEmbedder::new(64);
        assert!(matches!(embedder.embed("   "), Err(AgentError::Embedding(_))));
        assert!(matches!(embedder.embed("?!"), Err(AgentError::Embedding(_))));
    }

    #[test]
    fn test_related_text_is_closer() {
        let embedder = HashingEmbedder::new(256);
        let q = embedder.embed("react frontend developer").unwrap();
        let near = embedder.embed("I want to become a react frontend developer").unwrap();
        let far = embedder.embed("weekly grocery budget spreadsheet").unwrap();
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[test]
    fn test_guard_times_out_slow_capability() {
        let guard = CapabilityGuard::new(Duration::from_millis(20));
        let slow: Arc<dyn TextGenerator> =
            Arc::new(MockTextGenerator::new("late").slow(Duration::from_millis(300)));

        let err = guard.generate(&slow, "hello", 16).unwrap_err();
        assert!(matches!(err, AgentError::CapabilityTimeout { timeout_ms: 20, .. }));
    }

    #[test]
    fn test_guard_passes_through_result() {
        let guard = CapabilityGuard::new(Duration::from_secs(1));
        let gen: Arc<dyn TextGenerator> =
            Arc::new(MockTextGenerator::new("fallback").with_response("first"));
        assert_eq!(guard.generate(&gen, "p", 8).unwrap(), "first");
        assert_eq!(guard.generate(&gen, "p", 8).unwrap(), "fallback");
    }

    #[test]
    fn test_mock_generator_fails_then_recovers() {
        let gen = MockTextGenerator::new("ok").failing(1);
        assert!(gen.generate("p", 8).is_err());
        assert_eq!(gen.generate("p", 8).unwrap(), "ok");
        assert_eq!(gen.call_count(), 2);
    }

    #[test]
    fn test_static_job_board_filters() {
        let board = StaticJobBoard::new();
        let filters = JobFilters {
            keywords: vec!["react".to_string()],
            location: Some("New York".to_string()),
            remote_only: false,
            limit: 10,
        };
        let jobs = board.search(&filters).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].company, "DevFirst Solutions");

        let remote = JobFilters {
            keywords: vec!["python".to_string()],
            remote_only: true,
            ..Default::default()
        };
        let jobs = board.search(&remote).unwrap();
        assert!(jobs.iter().all(|j| j.remote));
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_resume_renderer_template_order() {
        let request = ResumeRequest {
            user_id: "u1".to_string(),
            target_role: Some("Frontend Developer".to_string()),
            template: "technical".to_string(),
            highlights: vec!["Built 3 React apps".to_string()],
        };
        let doc = PlainTextResumeRenderer.render(&request).unwrap();
        let skills = doc.content.find("## SKILLS").unwrap();
        let experience = doc.content.find("## EXPERIENCE").unwrap();
        assert!(skills < experience);
        assert!(doc.content.contains("Built 3 React apps"));

        let bad = ResumeRequest {
            template: "baroque".to_string(),
            ..request
        };
        assert!(matches!(
            PlainTextResumeRenderer.render(&bad),
            Err(AgentError::Tool { .. })
        ));
    }
}
