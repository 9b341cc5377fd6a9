use std::time::Duration;

use metrics_exporter_line::{AggregationFrequency, AggregationKind, LineExporterBuilder};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

fn main() {
    tracing_subscriber::fmt::init();

    let engine = LineExporterBuilder::default()
        .with_remote_address("localhost:9125")
        .expect("failed to parse remote address")
        .with_prefix("example")
        .with_flush_size(50)
        .with_flush_interval(Duration::from_secs(1))
        .with_telemetry(false)
        .build()
        .expect("failed to build metrics engine");

    let mut rng = Xoshiro256StarStar::try_from_rng(&mut rand::rng()).unwrap();

    // Pretend to serve requests for a while.
    for iteration in 0..10_000u64 {
        engine.put(&engine.sample("server_loops", iteration).with_tag("system", "foo"));

        let latency = engine
            .sample("request_latency_secs", rng.random_range(0.0..1.0))
            .with_aggregations([AggregationKind::P99, AggregationKind::Avg])
            .with_frequency(AggregationFrequency::Freq10)
            .with_sample_rate(Some(25));
        engine.put(&latency);

        std::thread::sleep(Duration::from_millis(1));
    }

    engine.shutdown();
}
