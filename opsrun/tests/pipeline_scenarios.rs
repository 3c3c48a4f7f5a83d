//! Library-level scenarios for the step runner and retry executor.
//!
//! These drive the public API the way an embedding application would: a
//! worker thread runs the pipeline while another thread owns the cancel
//! handle and receives lines through a channel-backed sink.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use opsrun::cancel::CancellationSignal;
use opsrun::core::backoff::RetryPolicy;
use opsrun::core::classifier::ErrorKind;
use opsrun::core::docker::{CleanupOptions, cleanup_steps};
use opsrun::core::types::StepSpec;
use opsrun::exit_codes;
use opsrun::pipeline::{PipelineOptions, run_steps};
use opsrun::retry::execute_with;
use opsrun::test_support::{FlakyOp, RecordingSleeper, sh_step};

#[test]
fn worker_thread_streams_lines_and_is_cancelled_from_caller() {
    let cancel = CancellationSignal::new();
    let worker_cancel = cancel.clone();
    let (tx, rx) = mpsc::channel::<String>();

    let worker = thread::spawn(move || {
        let steps = vec![
            sh_step(
                "ticker",
                "i=0; while [ $i -lt 50 ]; do echo tick$i; i=$((i+1)); sleep 0.1; done",
            ),
            StepSpec::new("after", ["true"]),
        ];
        let mut sink = |line: &str| {
            let _ = tx.send(line.to_string());
        };
        run_steps(&steps, &mut sink, &worker_cancel, &PipelineOptions::default())
    });

    // Wait for some live output, then cancel from this thread.
    let mut received = Vec::new();
    while received.len() < 4 {
        received.push(rx.recv_timeout(Duration::from_secs(10)).expect("live line"));
    }
    cancel.cancel();

    let result = worker.join().expect("worker");
    assert!(result.cancelled);
    assert_eq!(result.exit_code, exit_codes::CANCELLED);
    assert_eq!(result.steps_run, vec!["ticker"]);
    assert!(!result.transcript.iter().any(|line| line == "tick49"));
    assert_eq!(&result.transcript[..4], &received[..]);
}

#[test]
fn cancelled_step_is_killed_before_it_finishes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let marker = temp.path().join("marker");
    let steps = vec![sh_step("slow", "echo go; sleep 2; touch marker").in_dir(temp.path())];
    let cancel = CancellationSignal::new();
    let sink_cancel = cancel.clone();
    let mut sink = |line: &str| {
        if line == "go" {
            sink_cancel.cancel();
        }
    };

    let started = Instant::now();
    let result = run_steps(&steps, &mut sink, &cancel, &PipelineOptions::default());
    assert!(result.cancelled);
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "run_steps waited for the step: {:?}",
        started.elapsed()
    );

    thread::sleep(Duration::from_secs(3));
    assert!(!marker.exists(), "step kept running after cancellation");
}

#[test]
fn first_failure_wins_for_every_position() {
    for failing in 1..=4usize {
        let steps: Vec<StepSpec> = (1..=4usize)
            .map(|k| {
                let script = if k == failing {
                    format!("echo step{k}; exit 2")
                } else {
                    format!("echo step{k}")
                };
                sh_step(&format!("S{k}"), &script)
            })
            .collect();

        let result = run_steps(
            &steps,
            &mut |_: &str| {},
            &CancellationSignal::new(),
            &PipelineOptions::default(),
        );

        let expected_run: Vec<String> = (1..=failing).map(|k| format!("S{k}")).collect();
        assert_eq!(result.steps_run, expected_run, "failing = {failing}");
        assert_eq!(result.failed_step_label, Some(format!("S{failing}")));
        assert_eq!(result.exit_code, 2);
        assert!(
            !result
                .transcript
                .iter()
                .any(|line| line == &format!("step{}", failing + 1))
        );
    }
}

#[test]
fn wait_timeout_kills_process_that_closes_its_output_early() {
    // Closes stdout/stderr then keeps running, so reading ends but exit never comes.
    let steps = vec![sh_step("lingering", "echo bye; exec >&- 2>&-; sleep 30")];
    let options = PipelineOptions::default().with_wait_timeout(Duration::from_millis(300));

    let started = std::time::Instant::now();
    let result = run_steps(&steps, &mut |_: &str| {}, &CancellationSignal::new(), &options);

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(result.exit_code, exit_codes::WAIT_FAILED);
    assert_eq!(result.failed_step_label.as_deref(), Some("lingering"));
    assert!(result.transcript.contains(&"bye".to_string()));
}

#[test]
fn docker_plan_feeds_the_runner() {
    let steps = cleanup_steps(CleanupOptions::default());
    let cancel = CancellationSignal::new();
    cancel.cancel();

    let result = run_steps(&steps, &mut |_: &str| {}, &cancel, &PipelineOptions::default());

    assert!(result.cancelled);
    assert!(result.steps_run.is_empty());
    assert_eq!(
        result.transcript,
        vec!["Cancelled before step 'Remove stopped containers'"]
    );
}

#[test]
fn retry_schedule_matches_policy() {
    let policy = RetryPolicy::new(4, Duration::from_millis(250), ErrorKind::DEFAULT_TRANSIENT)
        .expect("policy");
    let sleeper = RecordingSleeper::default();
    let mut op = FlakyOp::new(3, ErrorKind::TransientIo, "done");

    let value = execute_with(|| op.call(), &policy, &sleeper).expect("success");

    assert_eq!(value, "done");
    assert_eq!(sleeper.recorded(), policy.schedule());
}
