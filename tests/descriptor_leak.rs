//! Descriptor accounting for the controlling process.
//!
//! Kept as a single test in its own binary: a concurrently running test
//! would open and close descriptors of its own and skew the count.

use nix::sys::resource::{Resource, getrlimit, setrlimit};
use pipesh::{CommandSet, Pipeline, PipelineError, run_background, run_foreground};
use std::fs;

fn open_fds() -> usize {
    // The directory handle itself is counted every time, so it cancels out.
    fs::read_dir("/dev/fd").unwrap().count()
}

fn set(lines: &[String]) -> CommandSet {
    lines.iter().cloned().collect()
}

#[test]
fn no_descriptor_outlives_a_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let out = dir.path().join("out.txt");
    fs::write(&input, "data\n").unwrap();

    let before = open_fds();

    // Successful pipeline with 4 pipes.
    let lines = vec![
        format!("cat < {}", input.display()),
        "cat".into(),
        "cat".into(),
        "cat".into(),
        format!("cat > {}", out.display()),
    ];
    let result = run_foreground(&set(&lines)).unwrap();
    assert_eq!(result.codes(), [0, 0, 0, 0, 0]);
    assert_eq!(open_fds(), before);

    // Children that fail after fork.
    let lines = vec!["pipesh-no-such-command".into(), "cat".into(), format!("cat > {}", out.display())];
    run_foreground(&set(&lines)).unwrap();
    assert_eq!(open_fds(), before);

    // Rejected at parse time.
    assert!(run_foreground(&set(&["cat".into(), "cat >".into()])).is_err());
    assert_eq!(open_fds(), before);

    // Background: the parent's pipe ends are closed as soon as it returns.
    let handles = run_background(&set(&["echo x".into(), "cat".into(), format!("cat > {}", out.display())])).unwrap();
    assert_eq!(open_fds(), before);
    handles.wait();

    // Pipe count is N - 1.
    let pipeline = Pipeline::parse(&set(&lines), 100).unwrap();
    let pipes = pipesh::pipe::PipeSet::allocate(pipeline.len()).unwrap();
    assert_eq!(pipes.len(), pipeline.len() - 1);
    assert_eq!(open_fds(), before + 2 * pipes.len());
    drop(pipes);
    assert_eq!(open_fds(), before);

    // Running out of descriptors halfway through: the pipes already made are
    // closed and no process starts.
    let marker = dir.path().join("spawned.txt");
    let mut lines = vec!["cat".to_string(); 50];
    lines[0] = format!("touch {}", marker.display());
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
    setrlimit(Resource::RLIMIT_NOFILE, 32, hard).unwrap();
    let result = run_foreground(&set(&lines));
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).unwrap();

    assert!(matches!(result, Err(PipelineError::PipeCreationFailed(_))), "{result:?}");
    assert_eq!(open_fds(), before);
    assert!(!marker.exists());
}
