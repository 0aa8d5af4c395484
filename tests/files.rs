//! File keys against a real directory.

use buildcore::fs::{file_key, FileRule, Stamp, PREFIX};
use buildcore::{Config, Engine, Failure, FnRule, Key, Rules, TaskContext, Value};
use filetime::{set_file_mtime, FileTime};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An engine where "obj" is built from the file at src.
fn engine(stamp: Stamp, src: &Path, runs: Arc<AtomicUsize>) -> anyhow::Result<Engine> {
    let mut rules = Rules::new();
    rules.register_prefix(PREFIX, FileRule::real(stamp));
    let src = file_key(src);
    rules.register(
        "obj",
        FnRule::new(move |cx: &mut TaskContext| {
            Ok(cx.need(&src).map(|v| {
                runs.fetch_add(1, Ordering::SeqCst);
                Value::new(v.data())
            }))
        }),
    );
    Ok(Engine::new(rules, Config::default().workers(2))?)
}

fn touch(path: &Path, secs: i64) -> std::io::Result<()> {
    set_file_mtime(path, FileTime::from_unix_time(secs, 0))
}

#[test]
fn content_stamp_ignores_touch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("in.c");
    std::fs::write(&src, "int x;")?;
    touch(&src, 1_000_000)?;
    let runs = Arc::new(AtomicUsize::new(0));
    let mut engine = engine(Stamp::Content, &src, runs.clone())?;

    assert_eq!(engine.build_key("obj")?.data(), b"int x;");
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    touch(&src, 2_000_000)?;
    engine.build_key("obj")?;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    std::fs::write(&src, "int y;")?;
    assert_eq!(engine.build_key("obj")?.data(), b"int y;");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn mtime_stamp_follows_touch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("in.c");
    std::fs::write(&src, "int x;")?;
    touch(&src, 1_000_000)?;
    let runs = Arc::new(AtomicUsize::new(0));
    let mut engine = engine(Stamp::MTime, &src, runs.clone())?;

    engine.build_key("obj")?;
    engine.build_key("obj")?;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    touch(&src, 2_000_000)?;
    engine.build_key("obj")?;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn missing_file_fails() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("gone.c");
    let runs = Arc::new(AtomicUsize::new(0));
    let mut engine = engine(Stamp::MTime, &src, runs.clone())?;

    let report = engine.build(&[Key::from("obj")]);
    assert_eq!(
        report.result(&Key::from("obj")),
        Some(&Err(Failure::Dependency(file_key(&src))))
    );
    match &report.diagnostics[0].failure {
        Failure::Task(msg) => assert!(msg.ends_with("gone.c: missing"), "{}", msg),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    Ok(())
}
