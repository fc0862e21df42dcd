use axum::{http::StatusCode, routing};
use prometheus::{
    opts, register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::net::SocketAddr;

pub const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.0001, // 0.1 ms
    0.0005, // 0.5 ms
    0.0010, // 1   ms
    0.0025, // 2.5 ms
    0.0050, // 5   ms
    0.0100, // 10  ms
    0.0250, // 25  ms
    0.0500, // 50  ms
    0.1000, // 100 ms
    0.2500, // 250 ms
    0.5000, // 500 ms
    1.0000, // 1    s
];

pub const ACME_DURATION_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 180.0, 300.0,
];

pub static DNS_REQUESTS_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "dns_requests_total",
            "Total number of DNS requests received."
        ),
        &["protocol"]
    )
    .unwrap()
});

pub static DNS_RESPONSES_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!("dns_responses_total", "Total number of DNS responses sent."),
            &["rcode"]
        )
        .unwrap()
    });

pub static DNS_RESPONSE_TIME_SECONDS: std::sync::LazyLock<HistogramVec> =
    std::sync::LazyLock::new(|| {
        register_histogram_vec!(
            "dns_response_time_seconds",
            "Response time of DNS requests.",
            &["protocol"],
            RESPONSE_TIME_BUCKETS.to_vec()
        )
        .unwrap()
    });

pub static ACME_OBTAIN_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "acme_obtain_total",
            "Total number of attempts to obtain a certificate from the ACME directory."
        ),
        &["result"]
    )
    .unwrap()
});

pub static ACME_OBTAIN_DURATION_SECONDS: std::sync::LazyLock<HistogramVec> =
    std::sync::LazyLock::new(|| {
        register_histogram_vec!(
            "acme_obtain_duration_seconds",
            "Time taken to obtain a certificate from the ACME directory.",
            &["result"],
            ACME_DURATION_BUCKETS.to_vec()
        )
        .unwrap()
    });

pub static CERT_REFRESH_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "cert_refresh_total",
            "Total number of certificate refresh cycles."
        ),
        &["result"]
    )
    .unwrap()
});

pub static CERT_EXPIRY_SECONDS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge!(opts!(
        "cert_expiry_seconds",
        "Unix timestamp at which the currently served certificate expires."
    ))
    .unwrap()
});

pub static CHALLENGE_PRESENT_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!(
                "challenge_present_total",
                "Total number of DNS-01 challenge values presented."
            ),
            &["domain"]
        )
        .unwrap()
    });

pub static CHALLENGE_CLEANUP_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!(
                "challenge_cleanup_total",
                "Total number of DNS-01 challenge values cleaned up."
            ),
            &["domain"]
        )
        .unwrap()
    });

pub static CHALLENGE_ACTIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge!(opts!(
        "challenge_active",
        "Number of DNS-01 challenge values currently being served."
    ))
    .unwrap()
});

async fn get_metrics() -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(metrics_str) => (StatusCode::OK, metrics_str),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub async fn serve_prometheus_endpoint_task(address: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new().route("/metrics", routing::get(get_metrics));
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
