use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use filetime::FileTime;
use rga_build::cli::{CommandLine, Invocation, ProcessInvoker};
use rga_build::config::AnalyzerConfig;
use rga_build::config::layout::{BUILD_OUTPUT_SPLITTER, LayoutStore};
use rga_build::error::ErrorKind;
use rga_build::orchestrator::{
    BuildEvent, BuildOrchestrator, BuildSink, BuildStatus, CollectingSink, MSG_INVALID_CLONE,
};
use rga_build::project::{
    BuildSettings, CloneId, Pipeline, PipelineKind, PipelineStage, Project, ProjectApi,
};
use rga_build::session::BuildSession;
use rga_build::workspace::OutputLayout;

const KERNEL: &str = "kernel void add(global int* a)\n{\n    a[0] += 1;\n}\n";

/// Stands in for the analyzer: records each call and writes the session
/// metadata and ISA tables a real build would leave behind.
struct FakeAnalyzer {
    sources: Vec<PathBuf>,
    failing: Vec<String>,
    silent: Vec<String>,
    calls: Mutex<Vec<String>>,
    gate: Option<Gate>,
}

struct Gate {
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl FakeAnalyzer {
    fn new(sources: &[PathBuf], failing: &[&str]) -> Self {
        Self {
            sources: sources.to_vec(),
            failing: failing.iter().map(|s| s.to_string()).collect(),
            silent: Vec::new(),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// These GPUs exit cleanly without writing session metadata.
    fn silent_for(mut self, gpus: &[&str]) -> Self {
        self.silent = gpus.iter().map(|s| s.to_string()).collect();
        self
    }

    /// The first call blocks until the test sends on the returned sender.
    fn gated(mut self) -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.gate = Some(Gate {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        (self, started_rx, release_tx)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn write_outputs(&self, gpu: &str, metadata: &Path) {
        let dir = metadata.parent().expect("clone dir");
        let mut xml = String::from("<ProgramOutputMetadata>\n  <Binary>codeobj.bin</Binary>\n");
        for src in &self.sources {
            let stem = src.file_stem().and_then(|s| s.to_str()).expect("stem");
            let csv = format!("{gpu}_{stem}.csv");
            let isa = format!("{gpu}_{stem}.isa");
            fs::write(
                dir.join(&csv),
                format!(
                    "Address,Source Line Number,Opcode,Operands,Functional Unit,Cycles,Binary Encoding\n\
                     {stem}:\n\
                     0,2,s_mov_b32,\"s0, 0\",ScalarALU,4,0xBE800080\n\
                     4,2,v_add_u32,\"v0, s0, v0\",VectorALU,4,0x68000000\n\
                     8,3,s_endpgm,,Branch,4,0xBF810000\n"
                ),
            )
            .expect("write csv");
            fs::write(dir.join(&isa), "s_mov_b32 s0, 0\n").expect("write isa");
            xml.push_str(&format!(
                "  <InputFile>\n    <Path>{}</Path>\n    <Entry>\n      <Name>{stem}</Name>\n      <Type>kernel</Type>\n      <Output>\n        <TargetGPU>{gpu}</TargetGPU>\n        <ISA>{isa}</ISA>\n        <CSV_ISA>{csv}</CSV_ISA>\n      </Output>\n    </Entry>\n  </InputFile>\n",
                src.display()
            ));
        }
        xml.push_str("</ProgramOutputMetadata>\n");
        fs::write(metadata, xml).expect("write metadata");
    }
}

impl ProcessInvoker for FakeAnalyzer {
    fn invoke(&self, cmd: &CommandLine) -> rga_build::Result<Invocation> {
        let gpu = cmd.value_of("--asic").expect("--asic").to_string();
        let metadata = PathBuf::from(cmd.value_of("--session-metadata").expect("metadata"));
        let first = {
            let mut calls = self.calls.lock().expect("calls");
            calls.push(cmd.to_string());
            calls.len() == 1
        };
        if first && let Some(gate) = &self.gate {
            gate.started.lock().expect("gate").send(()).expect("started");
            gate.release.lock().expect("gate").recv().expect("release");
        }
        if self.failing.contains(&gpu) {
            return Ok(Invocation {
                success: false,
                exit_code: Some(1),
                output: format!("Error: compilation for {gpu} failed\n"),
            });
        }
        if !self.silent.contains(&gpu) {
            self.write_outputs(&gpu, &metadata);
        }
        Ok(Invocation {
            success: true,
            exit_code: Some(0),
            output: format!("Building for {gpu}... succeeded.\n"),
        })
    }
}

/// Holds the worker inside `emit(BuildSucceeded)` until released.
struct BlockOnSuccess {
    inner: CollectingSink,
    reached: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl BlockOnSuccess {
    fn new() -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (reached_tx, reached_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let sink = Self {
            inner: CollectingSink::default(),
            reached: Mutex::new(reached_tx),
            release: Mutex::new(release_rx),
        };
        (sink, reached_rx, release_tx)
    }
}

impl BuildSink for BlockOnSuccess {
    fn emit(&self, ev: BuildEvent) {
        let blocks = matches!(ev, BuildEvent::BuildSucceeded { .. });
        self.inner.emit(ev);
        if blocks {
            self.reached.lock().expect("reached").send(()).expect("reached");
            self.release.lock().expect("release").recv().expect("release");
        }
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    sources: Vec<PathBuf>,
}

impl Fixture {
    fn new(files: &[&str]) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().canonicalize().expect("canonical tempdir");
        let src_dir = root.join("src");
        fs::create_dir_all(&src_dir).expect("src dir");
        let sources = files
            .iter()
            .map(|f| {
                let p = src_dir.join(f);
                fs::write(&p, KERNEL).expect("write source");
                p
            })
            .collect();
        Self {
            _tmp: tmp,
            root,
            sources,
        }
    }

    fn project(&self, gpus: &[&str]) -> Project {
        let mut p = Project::new("demo", ProjectApi::OpenCl, self.root.join("demo.toml"));
        let settings = p.add_settings(BuildSettings {
            target_gpus: gpus.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        });
        let clone = p.add_clone("Default", settings);
        for src in &self.sources {
            p.add_source_file(clone, src.clone()).expect("add source");
        }
        p
    }

    fn clone_dir(&self) -> PathBuf {
        OutputLayout::new(&AnalyzerConfig::default(), &self.root, CloneId(0)).clone_dir
    }

    fn session(
        &self,
        gpus: &[&str],
        analyzer: Arc<FakeAnalyzer>,
        sink: Arc<dyn BuildSink>,
    ) -> BuildSession {
        self.session_for(self.project(gpus), analyzer, sink)
    }

    fn session_for(
        &self,
        project: Project,
        analyzer: Arc<FakeAnalyzer>,
        sink: Arc<dyn BuildSink>,
    ) -> BuildSession {
        let orchestrator =
            BuildOrchestrator::new(Arc::new(AnalyzerConfig::default()), analyzer, sink);
        BuildSession::new(project, CloneId(0), orchestrator, LayoutStore::in_memory())
            .expect("session")
    }
}

#[test]
fn one_invocation_per_gpu_in_list_order() {
    let fx = Fixture::new(&["add.cl"]);
    let gpus = ["gfx900", "gfx1030", "gfx1100"];
    let analyzer = Arc::new(FakeAnalyzer::new(&fx.sources, &[]));
    let sink = Arc::new(CollectingSink::default());
    let mut session = fx.session(&gpus, analyzer.clone(), sink.clone());

    session.build().expect("build");
    let report = session.wait().expect("report");
    assert_eq!(report.status, BuildStatus::Succeeded);

    let calls = analyzer.calls();
    assert_eq!(calls.len(), 3);
    for (call, gpu) in calls.iter().zip(gpus) {
        assert!(call.contains(&format!("--asic {gpu}")), "{call}");
        assert!(call.contains(&format!("{gpu}_cliInvocation.xml")), "{call}");
    }
    assert_eq!(session.store().gpus().count(), 3);

    let log = sink.log_text();
    let first = log.find("for gfx900").expect("gfx900 header");
    let last = log.find("for gfx1100").expect("gfx1100 header");
    assert!(first < last);
}

#[test]
fn cancel_before_second_gpu_stops_after_one_invocation() {
    let fx = Fixture::new(&["add.cl"]);
    let (analyzer, started, release) = FakeAnalyzer::new(&fx.sources, &[]).gated();
    let analyzer = Arc::new(analyzer);
    let sink = Arc::new(CollectingSink::default());
    let mut session = fx.session(&["gfx900", "gfx1030", "gfx1100"], analyzer.clone(), sink.clone());

    session.build().expect("build");
    started.recv().expect("first invocation started");
    assert!(session.cancel());
    assert!(!session.cancel());
    release.send(()).expect("release");
    let report = session.wait().expect("report");

    assert_eq!(report.status, BuildStatus::Cancelled);
    assert_eq!(analyzer.calls().len(), 1);
    assert!(session.store().is_empty());
    assert!(!fx.clone_dir().exists());
    let cancelled = sink
        .events()
        .iter()
        .filter(|e| **e == BuildEvent::BuildCancelled)
        .count();
    assert_eq!(cancelled, 1);
    assert!(report.log.contains("Build canceled."));
}

#[test]
fn second_build_is_rejected_while_one_runs() {
    let fx = Fixture::new(&["add.cl"]);
    let (analyzer, started, release) = FakeAnalyzer::new(&fx.sources, &[]).gated();
    let mut session = fx.session(
        &["gfx900"],
        Arc::new(analyzer),
        Arc::new(CollectingSink::default()),
    );

    session.build().expect("build");
    started.recv().expect("started");
    let err = session.build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BuildInProgress);
    release.send(()).expect("release");
    assert_eq!(session.wait().expect("report").status, BuildStatus::Succeeded);
}

#[test]
fn one_failing_gpu_still_succeeds_with_the_other() {
    let fx = Fixture::new(&["add.cl"]);
    let analyzer = Arc::new(FakeAnalyzer::new(&fx.sources, &["gfx1030"]));
    let sink = Arc::new(CollectingSink::default());
    let mut session = fx.session(&["gfx900", "gfx1030"], analyzer, sink.clone());

    session.build().expect("build");
    let report = session.wait().expect("report");

    assert_eq!(report.status, BuildStatus::Succeeded);
    assert!(session.store().gpu("gfx900").is_some());
    assert!(session.store().gpu("gfx1030").is_none());
    assert_eq!(
        sink.events().last(),
        Some(&BuildEvent::BuildSucceeded {
            gpus: vec!["gfx900".into()]
        })
    );
    assert!(report.log.contains("compilation for gfx1030 failed"));
}

#[test]
fn no_output_at_all_is_a_failure() {
    let fx = Fixture::new(&["add.cl"]);
    let analyzer = Arc::new(FakeAnalyzer::new(&fx.sources, &["gfx900", "gfx1030"]));
    let sink = Arc::new(CollectingSink::default());
    let mut session = fx.session(&["gfx900", "gfx1030"], analyzer, sink.clone());

    session.build().expect("build");
    let report = session.wait().expect("report");

    assert_eq!(report.status, BuildStatus::Failed);
    assert!(session.store().is_empty());
    assert!(matches!(sink.events().last(), Some(BuildEvent::BuildFailed { .. })));
    assert!(session.orchestrator().last_successful_build().is_none());
}

#[test]
fn saving_after_build_goes_stale_until_rebuilt() {
    let fx = Fixture::new(&["add.cl"]);
    let src = fx.sources[0].clone();
    let analyzer = Arc::new(FakeAnalyzer::new(&fx.sources, &[]));
    let mut session = fx.session(&["gfx900"], analyzer, Arc::new(CollectingSink::default()));

    session.build().expect("build");
    let report = session.wait().expect("report");
    assert!(session.is_line_correlation_enabled(&src));
    let h = session.select_line(&src, 2).expect("select");
    assert_eq!(h.disassembly_rows, vec![1, 2]);

    let later = report.finished_at.timestamp() + 10;
    filetime::set_file_mtime(&src, FileTime::from_unix_time(later, 0)).expect("mtime");
    assert!(!session.save_source_file(&src).expect("save"));
    assert!(!session.is_line_correlation_enabled(&src));
    assert!(session.select_line(&src, 2).expect("select").is_empty());

    session.build().expect("rebuild");
    session.wait().expect("report");
    assert!(session.is_line_correlation_enabled(&src));
    let h = session.select_line(&src, 3).expect("select");
    assert_eq!(h.disassembly_rows, vec![3]);

    let h = session.select_disassembly_rows("add", &[1, 2]).expect("rows");
    assert_eq!(h.source_line, Some(2));
}

#[test]
fn removing_a_file_deletes_only_its_artifacts() {
    let fx = Fixture::new(&["a.cl", "b.cl"]);
    let (a, b) = (fx.sources[0].clone(), fx.sources[1].clone());
    let analyzer = Arc::new(FakeAnalyzer::new(&fx.sources, &[]));
    let mut session = fx.session(
        &["gfx900", "gfx1030"],
        analyzer,
        Arc::new(CollectingSink::default()),
    );
    session.build().expect("build");
    session.wait().expect("report");

    let dir = fx.clone_dir();
    assert!(session.remove_input_file(&a).expect("remove a"));
    for gpu in ["gfx900", "gfx1030"] {
        assert!(!dir.join(format!("{gpu}_a.csv")).exists());
        assert!(!dir.join(format!("{gpu}_a.isa")).exists());
        assert!(dir.join(format!("{gpu}_b.csv")).exists());
        assert!(dir.join(format!("{gpu}_b.isa")).exists());
        assert!(session.store().file_outputs(gpu, &b).is_some());
    }
    assert!(!session.store().has_output_for_file(&a));
    assert!(session.project().clones[0].source_file(&a).is_none());

    assert!(session.remove_input_file(&b).expect("remove b"));
    assert!(!dir.exists());
    assert!(session.store().is_empty());
    assert!(!session.remove_input_file(&b).expect("already gone"));
}

#[test]
fn rebuild_purges_artifacts_of_removed_gpus() {
    let fx = Fixture::new(&["add.cl"]);
    let analyzer = Arc::new(FakeAnalyzer::new(&fx.sources, &[]));
    let mut session = fx.session(&["gfx900"], analyzer, Arc::new(CollectingSink::default()));
    let stale = fx.clone_dir().join("gfx803_add.csv");
    fs::create_dir_all(fx.clone_dir()).expect("clone dir");
    fs::write(&stale, "old").expect("stale artifact");

    session.build().expect("build");
    session.wait().expect("report");
    assert!(!stale.exists());
    assert!(fx.clone_dir().join("gfx900_add.csv").exists());
}

#[test]
fn project_and_splitters_persist() {
    let fx = Fixture::new(&["add.cl"]);
    let layout_path = fx.root.join("layout.toml");
    let orchestrator = BuildOrchestrator::new(
        Arc::new(AnalyzerConfig::default()),
        Arc::new(FakeAnalyzer::new(&fx.sources, &[])),
        Arc::new(CollectingSink::default()),
    );
    let mut session = BuildSession::new(
        fx.project(&["gfx900"]),
        CloneId(0),
        orchestrator,
        LayoutStore::open(&layout_path).expect("layout"),
    )
    .expect("session");

    session
        .record_splitter(BUILD_OUTPUT_SPLITTER, vec![600, 200])
        .expect("splitter");
    let extra = fx.root.join("src").join("extra.cl");
    fs::write(&extra, KERNEL).expect("extra");
    assert!(session.add_file(extra.clone()).expect("add"));
    assert!(!session.add_file(extra.clone()).expect("add twice"));

    let reopened = LayoutStore::open(&layout_path).expect("reopen");
    assert_eq!(reopened.get(BUILD_OUTPUT_SPLITTER), Some(&[600, 200][..]));
    let saved = rga_build::project::load(&fx.root.join("demo.toml")).expect("load project");
    assert!(saved.clones[0].source_file(&extra).is_some());
}

#[test]
fn cancel_is_refused_once_the_worker_reports_success() {
    let fx = Fixture::new(&["add.cl"]);
    let analyzer = Arc::new(FakeAnalyzer::new(&fx.sources, &[]));
    let (sink, reached, release) = BlockOnSuccess::new();
    let sink = Arc::new(sink);
    let mut session = fx.session(&["gfx900"], analyzer, sink.clone());

    session.build().expect("build");
    reached.recv().expect("worker reached success");
    assert!(!session.cancel());
    release.send(()).expect("release");
    let report = session.wait().expect("report");

    assert_eq!(report.status, BuildStatus::Succeeded);
    assert!(session.store().gpu("gfx900").is_some());
    assert!(fx.clone_dir().join("gfx900_add.csv").exists());
    let terminal: Vec<BuildEvent> = sink
        .inner
        .events()
        .into_iter()
        .filter(BuildEvent::is_terminal)
        .collect();
    assert_eq!(
        terminal,
        vec![BuildEvent::BuildSucceeded {
            gpus: vec!["gfx900".into()]
        }]
    );
}

#[test]
fn cancelled_worker_keeps_the_output_tree_until_it_returns() {
    let fx = Fixture::new(&["add.cl"]);
    let src = fx.sources[0].clone();
    let (analyzer, started, release) = FakeAnalyzer::new(&fx.sources, &[]).gated();
    let mut session = fx.session(
        &["gfx900", "gfx1030"],
        Arc::new(analyzer),
        Arc::new(CollectingSink::default()),
    );

    session.build().expect("build");
    started.recv().expect("started");
    assert!(session.cancel());
    assert!(!session.orchestrator().is_build_in_progress());
    assert!(session.orchestrator().has_worker());

    let err = session.remove_input_file(&src).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BuildInProgress);
    let err = session.build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BuildInProgress);
    assert!(session.project().clones[0].source_file(&src).is_some());

    release.send(()).expect("release");
    assert_eq!(session.wait().expect("report").status, BuildStatus::Cancelled);
    assert!(!session.orchestrator().has_worker());
    assert!(session.remove_input_file(&src).expect("remove after cancel"));
}

#[test]
fn invalid_vulkan_clone_fails_without_invoking_the_analyzer() {
    let fx = Fixture::new(&["shader.frag"]);
    let mut project = Project::new("vk", ProjectApi::Vulkan, fx.root.join("vk.toml"));
    let settings = project.add_settings(BuildSettings {
        target_gpus: vec!["gfx1030".into()],
        ..Default::default()
    });
    let id = project.add_clone("Default", settings);
    let mut pipeline = Pipeline::new(PipelineKind::Unknown);
    pipeline.set_stage(PipelineStage::Fragment, fx.sources[0].clone());
    project.clone_by_id_mut(id).expect("clone").pipeline = Some(pipeline);

    let analyzer = Arc::new(FakeAnalyzer::new(&fx.sources, &[]));
    let sink = Arc::new(CollectingSink::default());
    let mut session = fx.session_for(project, analyzer.clone(), sink.clone());

    session.build().expect("build");
    let report = session.wait().expect("report");

    assert_eq!(report.status, BuildStatus::Failed);
    assert!(report.log.contains(MSG_INVALID_CLONE));
    assert!(analyzer.calls().is_empty());
    assert!(session.store().is_empty());
    assert_eq!(
        sink.events().last(),
        Some(&BuildEvent::BuildFailed {
            reason: MSG_INVALID_CLONE.into()
        })
    );
}

#[test]
fn clean_exit_without_metadata_yields_no_output_for_that_gpu() {
    let fx = Fixture::new(&["add.cl"]);
    let analyzer = Arc::new(FakeAnalyzer::new(&fx.sources, &[]).silent_for(&["gfx1030"]));
    let sink = Arc::new(CollectingSink::default());
    let mut session = fx.session(&["gfx900", "gfx1030"], analyzer, sink.clone());

    session.build().expect("build");
    let report = session.wait().expect("report");

    assert_eq!(report.status, BuildStatus::Succeeded);
    assert_eq!(report.invoked_ok, vec!["gfx900".to_string(), "gfx1030".to_string()]);
    assert_eq!(report.loaded, vec!["gfx900".to_string()]);
    assert!(session.store().gpu("gfx1030").is_none());
    assert_eq!(
        sink.events().last(),
        Some(&BuildEvent::BuildSucceeded {
            gpus: vec!["gfx900".into()]
        })
    );
}
