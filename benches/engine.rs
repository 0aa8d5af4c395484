use buildcore::{Config, Engine, FnRule, Key, Rules, TaskContext, Value};
use criterion::{criterion_group, criterion_main, Criterion};

/// A graph shaped like a C project: `width` sources, one object per source
/// and a single link step over all objects.
fn wide_rules(width: usize) -> Rules {
    let mut rules = Rules::new();
    rules.register_prefix(
        "src:",
        FnRule::new(|cx: &mut TaskContext| Ok(Some(Value::new(cx.key().as_bytes())))),
    );
    rules.register_prefix(
        "obj:",
        FnRule::new(|cx: &mut TaskContext| {
            let name = &cx.key().as_bytes()[4..];
            let src = Key::new([b"src:", name].concat());
            Ok(cx.need(src).map(|v| Value::new(v.data())))
        }),
    );
    rules.register(
        "link",
        FnRule::new(move |cx: &mut TaskContext| {
            let mut out = Vec::new();
            let mut missing = false;
            for i in 0..width {
                match cx.need(format!("obj:{}.c", i)) {
                    Some(v) => out.extend_from_slice(v.data()),
                    None => missing = true,
                }
            }
            Ok(if missing { None } else { Some(Value::new(out)) })
        }),
    );
    rules
}

pub fn bench_build(c: &mut Criterion) {
    let roots = [Key::from("link")];

    c.bench_function("wide build", |b| {
        b.iter(|| {
            let mut engine = Engine::new(wide_rules(1000), Config::default()).unwrap();
            assert!(engine.build(&roots).succeeded());
        })
    });

    let mut engine = Engine::new(wide_rules(1000), Config::default()).unwrap();
    engine.build(&roots);
    c.bench_function("no-op rebuild", |b| {
        b.iter(|| {
            assert_eq!(engine.build(&roots).executed, 0);
        })
    });

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    {
        let mut engine = Engine::new(wide_rules(1000), Config::default()).unwrap();
        engine.attach_db(&db_path).unwrap();
        engine.build(&roots);
    }
    c.bench_function("no-op rebuild from database", |b| {
        b.iter(|| {
            let mut engine = Engine::new(wide_rules(1000), Config::default()).unwrap();
            engine.attach_db(&db_path).unwrap();
            assert_eq!(engine.build(&roots).executed, 0);
        })
    });
}

criterion_group!(benches, bench_build);
criterion_main!(benches);
