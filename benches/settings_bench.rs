use criterion::{self, criterion_group, criterion_main, BenchmarkId};

use amsettings::{Mode, Settings, SettingsConfig, SqliteDb};
use tokio::runtime::Runtime;

fn master(rt: &Runtime) -> Settings<SqliteDb> {
    rt.block_on(async {
        let db = SqliteDb::open_in_memory().expect("Open in-memory settings database");
        Settings::start(SettingsConfig::new(db).with_mode(Mode::Master))
            .await
            .expect("Start master node")
    })
}

fn write_changed(c: &mut criterion::Criterion) {
    let rt = Runtime::new().unwrap();
    let settings = master(&rt);
    let mut i = 0u64;

    c.bench_with_input(BenchmarkId::new("set", "changed"), &settings, |b, s| {
        b.to_async(&rt).iter(|| {
            i += 1;
            let value = i.to_string();
            async move {
                s.set("key".to_string(), value).await.unwrap();
            }
        })
    });
}

fn write_unchanged(c: &mut criterion::Criterion) {
    let rt = Runtime::new().unwrap();
    let settings = master(&rt);
    rt.block_on(settings.set("key".to_string(), "value".to_string()))
        .unwrap();

    c.bench_with_input(BenchmarkId::new("set", "unchanged"), &settings, |b, s| {
        b.to_async(&rt).iter(|| async {
            s.set("key".to_string(), "value".to_string()).await.unwrap();
        })
    });
}

fn read(c: &mut criterion::Criterion) {
    let rt = Runtime::new().unwrap();
    let settings = master(&rt);

    c.bench_with_input(BenchmarkId::new("get", "missing"), &settings, |b, s| {
        b.to_async(&rt).iter(|| async {
            assert_eq!(s.get("value".to_string()).await.unwrap(), None);
        })
    });
}

criterion_group!(benches, write_changed, write_unchanged, read);
criterion_main!(benches);
