use segmap::{Bincode, CodecRegistry, MapConfig, Native, SegmapError, SegmentMap};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct MyDto {
    s1: Option<String>,
    s2: Option<String>,
}

fn main() -> Result<(), SegmapError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    println!("=== Segment Traversal Demo ===\n");

    let dir = std::env::temp_dir().join("segmap-demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("dto.map");
    let _ = std::fs::remove_file(&path);

    let config = MapConfig::builder()
        .entries(256)
        .average_value_size(128)
        .actual_segments(1)
        .codecs(CodecRegistry::new().register::<MyDto>("MyDto"))
        .build();
    let map: SegmentMap<Native<i32>, Bincode<MyDto>> =
        SegmentMap::open_or_create_or_recover(&path, config, Native::default(), Bincode::default())?;

    for i in 0..20 {
        let dto = MyDto {
            s1: Some(format!("left {i}")),
            s2: (i % 3 == 0).then(|| format!("right {i}")),
        };
        map.put(&i, &dto)?;
    }
    println!("1. Stored {} entries", map.len()?);

    println!("2. Traversing segment 0 while another thread writes:");
    let shared = &map;
    thread::scope(|scope| -> Result<(), SegmapError> {
        let context = shared.segment_context(0)?;
        let mut visited = 0;
        let mut writer = None;
        context.for_each_segment_entry_while(|entry| {
            if visited == 0 {
                writer = Some(scope.spawn(move || {
                    // blocks until the traversal releases segment 0
                    for i in 100..110 {
                        shared.put(&i, &MyDto { s1: None, s2: None })?;
                    }
                    println!("   writer finished");
                    Ok::<_, SegmapError>(())
                }));
            }
            visited += 1;
            println!("   {} => {:?}", entry.key()?, entry.value()?);
            thread::sleep(Duration::from_millis(20));
            Ok::<_, SegmapError>(visited < 10)
        })?;
        println!("   stopped after {visited} entries, lock released");
        if let Some(writer) = writer {
            writer
                .join()
                .map_err(|_| SegmapError::InvalidInput("writer thread panicked".into()))??;
        }
        Ok(())
    })?;

    println!("3. Entries after writer: {}", map.len()?);
    println!("4. Stats: {:?}", map.segment_stats(0)?);

    map.close()?;
    println!("\n=== Demo completed ===");
    Ok(())
}
