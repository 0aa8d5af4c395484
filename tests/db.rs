//! Crash consistency of the build database: cutting the file anywhere inside
//! the last append leaves either the old or the new state, never a mix.

use buildcore::db::{Database, Dependency, Record};
use buildcore::{Key, Value};
use std::path::Path;

fn record(data: &str, inputs: &[&str], epoch: u64) -> Record {
    Record {
        value: Value::new(data),
        dependencies: inputs
            .iter()
            .map(|&k| Dependency {
                key: Key::from(k),
                signature: *Value::new(k).signature(),
            })
            .collect(),
        built_at: epoch,
        computed_at: epoch,
    }
}

/// Writes a database with two records, then appends `last`.  Returns the
/// file length before and after the last append.
fn write_db(path: &Path, last: (&str, Record)) -> anyhow::Result<(u64, u64)> {
    let mut db = Database::create(path)?;
    db.set_epoch(1)?;
    db.put(&Key::from("obj"), record("old obj", &["src"], 1))?;
    db.put(&Key::from("src"), record("src", &[], 1))?;
    let before = std::fs::metadata(path)?.len();
    db.put(&Key::from(last.0), last.1)?;
    let after = std::fs::metadata(path)?.len();
    Ok((before, after))
}

fn check_every_cut(
    last_key: &str,
    last: Record,
    check: impl Fn(bool, Option<&Record>),
) -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let full = dir.path().join("full");
    let (before, after) = write_db(&full, (last_key, last))?;
    assert!(after > before);
    let bytes = std::fs::read(&full)?;

    for cut in before..=after {
        let path = dir.path().join(format!("cut{}", cut));
        std::fs::write(&path, &bytes[..cut as usize])?;
        let db = Database::open(&path)?;
        assert_eq!(db.get(&Key::from("src")).map(|r| r.value.data()), Some(&b"src"[..]));
        check(cut == after, db.get(&Key::from(last_key)));
        // The torn tail is cut off.
        let len = std::fs::metadata(&path)?.len();
        assert!(len >= before && len <= cut);
    }
    Ok(())
}

#[test]
fn update_is_old_or_new() -> anyhow::Result<()> {
    let new = record("new obj", &["src", "extra"], 2);
    let expected = new.clone();
    check_every_cut("obj", new, |complete, got| {
        let got = got.expect("obj always has a record");
        if complete {
            assert_eq!(got, &expected);
        } else {
            assert_eq!(got.value.data(), b"old obj");
            assert_eq!(got.dependencies.len(), 1);
        }
    })
}

#[test]
fn insert_is_absent_or_new() -> anyhow::Result<()> {
    let new = record("fresh", &["src", "obj", "brand/new/input"], 2);
    let expected = new.clone();
    check_every_cut("fresh", new, |complete, got| {
        if complete {
            assert_eq!(got, Some(&expected));
        } else {
            assert_eq!(got, None);
        }
    })
}

#[test]
fn reopened_database_accepts_writes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db");
    let (before, after) = write_db(&path, ("late", record("late", &[], 1)))?;

    let bytes = std::fs::read(&path)?;
    let cut = before + (after - before) / 2;
    std::fs::write(&path, &bytes[..cut as usize])?;

    {
        let mut db = Database::open(&path)?;
        assert!(db.get(&Key::from("late")).is_none());
        db.put(&Key::from("late"), record("late again", &["src"], 2))?;
    }
    let db = Database::open_read_only(&path)?;
    let late = db.get(&Key::from("late")).expect("record for late");
    assert_eq!(late.value.data(), b"late again");
    assert_eq!(late.dependencies[0].key, Key::from("src"));
    assert_eq!(db.len(), 3);
    Ok(())
}
