use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::capture::CaptureManager;
use crate::llm::LlmClient;
use crate::logger;
use crate::models::CaptureBundle;
use crate::refiners::{self, Refiner};
use crate::store::{MemoryStore, RememberRequest};

const INITIAL_DELAY: std::time::Duration = std::time::Duration::from_secs(60);

/// Refiners that jump their cooldown when the developer switches projects.
const PROJECT_REFINERS: &[&str] = &["context-extractor", "project-extractor"];

struct SchedulerState {
    last_run: HashMap<String, DateTime<Utc>>,
    last_project: String,
    extracted_today: u64,
    today: NaiveDate,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    /// Refiners whose thresholds and cooldowns allowed an attempt.
    pub attempted: Vec<String>,
    pub persisted: usize,
    pub project_switched: bool,
}

/// Drives the refiner set on a fixed interval: builds the capture bundle,
/// detects project switches, honors per-refiner cooldowns, persists whatever
/// the refiners extract.
pub struct RefinerScheduler {
    refiners: Vec<Box<dyn Refiner>>,
    manager: Arc<CaptureManager>,
    store: Arc<MemoryStore>,
    llm: Arc<LlmClient>,
    interval_minutes: i64,
    state: Mutex<SchedulerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RefinerScheduler {
    pub fn new(
        manager: Arc<CaptureManager>,
        store: Arc<MemoryStore>,
        llm: Arc<LlmClient>,
        interval_minutes: u64,
    ) -> Self {
        Self {
            refiners: refiners::all(),
            manager,
            store,
            llm,
            interval_minutes: interval_minutes.max(1) as i64,
            state: Mutex::new(SchedulerState {
                last_run: HashMap::new(),
                last_project: String::new(),
                extracted_today: 0,
                today: chrono::Local::now().date_naive(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(INITIAL_DELAY).await;
            let period = std::time::Duration::from_secs(scheduler.interval_minutes as u64 * 60);
            let mut timer = tokio::time::interval(period);
            loop {
                timer.tick().await;
                let report = scheduler.run_cycle().await;
                if !report.attempted.is_empty() {
                    logger::info_with(
                        "refiner",
                        "cycle complete",
                        serde_json::json!({
                            "attempted": report.attempted,
                            "persisted": report.persisted,
                            "projectSwitched": report.project_switched,
                        }),
                    );
                }
            }
        });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let window = ChronoDuration::minutes(self.interval_minutes * 2);
        let bundle = self.manager.bundle_since(Utc::now() - window);
        self.run_cycle_with(bundle).await
    }

    pub async fn run_cycle_with(&self, bundle: CaptureBundle) -> CycleReport {
        let now = Utc::now();
        let mut report = CycleReport::default();

        let current_project = detect_project(&bundle);
        let force_project_refiners = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

            let today = chrono::Local::now().date_naive();
            if state.today != today {
                state.today = today;
                state.extracted_today = 0;
            }

            let switched = !current_project.is_empty()
                && !state.last_project.is_empty()
                && current_project != state.last_project;
            if !current_project.is_empty() {
                state.last_project = current_project.clone();
            }
            if switched {
                logger::info(
                    "refiner",
                    &format!("project switch detected, now on {current_project}"),
                );
            }
            switched
        };
        report.project_switched = force_project_refiners;

        for refiner in &self.refiners {
            let name = refiner.name();
            if !refiner.has_enough_data(&bundle) {
                continue;
            }

            let skip_cooldown = force_project_refiners && PROJECT_REFINERS.contains(&name);
            if !skip_cooldown && !self.cooldown_elapsed(refiner.as_ref(), now) {
                continue;
            }
            report.attempted.push(name.to_string());

            let memories = refiners::refine(refiner.as_ref(), &bundle, &self.llm).await;

            // a cycle against a dead endpoint does not consume the cooldown
            if self.llm.last_known_available() {
                self.state
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .last_run
                    .insert(name.to_string(), now);
            }

            for memory in memories {
                let request = RememberRequest {
                    content: memory.content,
                    memory_type: memory.memory_type,
                    tags: memory.tags,
                    importance: memory.importance,
                    confidence: memory.confidence,
                    pinned: false,
                    who: None,
                    source: Some(memory.source),
                };
                match self.store.remember(request).await {
                    Ok(_) => {
                        report.persisted += 1;
                        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                        state.extracted_today += 1;
                    }
                    Err(e) => {
                        logger::warn("refiner", &format!("persisting {name} memory failed: {e}"))
                    }
                }
            }
        }

        report
    }

    fn cooldown_elapsed(&self, refiner: &dyn Refiner, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state.last_run.get(refiner.name()) {
            Some(last) => now - *last >= ChronoDuration::minutes(refiner.cooldown_minutes()),
            None => true,
        }
    }

    pub fn last_refiner_run(&self) -> HashMap<String, String> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .last_run
            .iter()
            .map(|(name, ts)| (name.clone(), ts.to_rfc3339()))
            .collect()
    }

    pub fn memories_extracted_today(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extracted_today
    }

    #[cfg(test)]
    fn seed_state(&self, last_project: &str, last_run: &[(&str, DateTime<Utc>)]) {
        let mut state = self.state.lock().unwrap();
        state.last_project = last_project.to_string();
        for (name, ts) in last_run {
            state.last_run.insert((*name).to_string(), *ts);
        }
    }
}

/// Derive the current project: the last dash-separated segment of the newest
/// screen window, or the path segment after `projects` in the newest file
/// activity.
pub fn detect_project(bundle: &CaptureBundle) -> String {
    if let Some(capture) = bundle.screen.last() {
        let window = &capture.focused_window;
        let segment = window
            .rsplit(['—', '–', '-'])
            .next()
            .map(|s| s.trim())
            .unwrap_or("");
        if !segment.is_empty() {
            return segment.to_string();
        }
    }

    if let Some(activity) = bundle.files.last() {
        let segments: Vec<&str> = activity
            .file_path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if let Some(idx) = segments.iter().position(|s| *s == "projects") {
            if let Some(project) = segments.get(idx + 1) {
                return (*project).to_string();
            }
        }
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, SearchConfig};
    use crate::models::{new_event_id, FileActivity, FileEventKind, ScreenCapture};

    fn scheduler(dir: &tempfile::TempDir) -> RefinerScheduler {
        let manager = Arc::new(CaptureManager::new(Vec::new()));
        let store = Arc::new(
            MemoryStore::open(
                &dir.path().join("memories.db"),
                &EmbeddingConfig::default(),
                SearchConfig::default(),
                "http://127.0.0.1:9",
            )
            .unwrap(),
        );
        // port 9 (discard) refuses immediately, so cycles see a dead endpoint
        let llm = Arc::new(LlmClient::new("http://127.0.0.1:9", "test-model"));
        RefinerScheduler::new(manager, store, llm, 20)
    }

    fn screen_bundle(count: usize, window: &str) -> CaptureBundle {
        let mut bundle = CaptureBundle::default();
        for _ in 0..count {
            bundle.screen.push(ScreenCapture {
                id: new_event_id(),
                timestamp: Utc::now(),
                focused_app: "Code".into(),
                focused_window: window.into(),
                bundle_id: None,
                ocr_text: String::new(),
            });
        }
        bundle
    }

    #[test]
    fn detect_project_prefers_screen_window_suffix() {
        let bundle = screen_bundle(1, "main.ts — beta");
        assert_eq!(detect_project(&bundle), "beta");

        let hyphenated = screen_bundle(1, "lib.rs - gamma");
        assert_eq!(detect_project(&hyphenated), "gamma");
    }

    #[test]
    fn detect_project_falls_back_to_projects_path_segment() {
        let mut bundle = CaptureBundle::default();
        bundle.files.push(FileActivity {
            id: new_event_id(),
            timestamp: Utc::now(),
            event_type: FileEventKind::Modify,
            file_path: "/home/dev/projects/delta/src/main.rs".into(),
            file_type: "rs".into(),
            is_git_repo: true,
            git_branch: Some("main".into()),
            size_bytes: Some(100),
        });
        assert_eq!(detect_project(&bundle), "delta");
        assert_eq!(detect_project(&CaptureBundle::default()), "");
    }

    #[tokio::test]
    async fn project_switch_forces_project_refiners_past_cooldown() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sched = scheduler(&dir);
        let just_ran = Utc::now() - ChronoDuration::minutes(1);
        sched.seed_state(
            "alpha",
            &[
                ("context-extractor", just_ran),
                ("project-extractor", just_ran),
            ],
        );

        let report = sched.run_cycle_with(screen_bundle(3, "main.ts — beta")).await;
        assert!(report.project_switched);
        assert!(report.attempted.iter().any(|n| n == "context-extractor"));
        assert!(report.attempted.iter().any(|n| n == "project-extractor"));
        // three screen captures are below the skill threshold
        assert!(!report.attempted.iter().any(|n| n == "skill-extractor"));
    }

    #[tokio::test]
    async fn cooldown_blocks_without_project_switch() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sched = scheduler(&dir);
        let just_ran = Utc::now() - ChronoDuration::minutes(1);
        sched.seed_state("beta", &[("context-extractor", just_ran)]);

        // same project as seeded: no switch, cooldown applies
        let report = sched.run_cycle_with(screen_bundle(3, "main.ts — beta")).await;
        assert!(!report.project_switched);
        assert!(!report.attempted.iter().any(|n| n == "context-extractor"));
    }

    #[tokio::test]
    async fn dead_endpoint_does_not_consume_cooldown() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sched = scheduler(&dir);
        let report = sched.run_cycle_with(screen_bundle(3, "main.ts — beta")).await;
        assert!(report.attempted.iter().any(|n| n == "context-extractor"));
        // the endpoint never answered, so nothing was recorded as run
        assert!(sched.last_refiner_run().is_empty());
        assert_eq!(sched.memories_extracted_today(), 0);
    }

    #[tokio::test]
    async fn empty_bundle_attempts_nothing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sched = scheduler(&dir);
        let report = sched.run_cycle_with(CaptureBundle::default()).await;
        assert!(report.attempted.is_empty());
    }
}
