use std::time::Duration;

use trawl_client::ReqwestTransport;
use trawl_core::config::PipelineConfig;
use trawl_core::governor::RateGovernorConfig;
use trawl_core::job::{JobOptions, RetryConfig};
use wiremock::MockServer;

/// Transport pointed at `<server>/v1`, with private addresses allowed.
pub fn transport(server: &MockServer) -> ReqwestTransport {
    ReqwestTransport::with_timeout(Duration::from_secs(5))
        .unwrap()
        .with_base_url(&format!("{}/v1", server.uri()))
        .unwrap()
        .allow_private_urls()
}

/// Pipeline settings that keep tests fast.
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default()
        .with_endpoint_name("wiremock")
        .with_request_timeout(Duration::from_secs(2));
    config.governor = RateGovernorConfig::new(500.0, 1.0, 1000.0);
    config
}

pub fn fast_options(batch_size: usize) -> JobOptions {
    JobOptions::default().with_batch_size(batch_size).with_retry(
        RetryConfig::default()
            .with_base_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(50)),
    )
}
