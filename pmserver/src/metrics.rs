use once_cell::sync::Lazy;
use prometheus::{
    IntCounterVec, IntGaugeVec, TextEncoder, register_int_counter_vec, register_int_gauge_vec,
};

pub static MIRROR_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mirror_requests_total",
        "Mirror requests by upstream registry and result",
        &["registry", "result"]
    )
    .unwrap()
});

pub static TRACKED_IMAGES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tracker_images",
        "Images advertised from the local store",
        &["registry"]
    )
    .unwrap()
});

pub static TRACKED_DIGESTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tracker_digests",
        "Unique content digests advertised from the local store",
        &["registry"]
    )
    .unwrap()
});

pub static TRACKED_TAGS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tracker_tags",
        "Tagged references advertised from the local store",
        &["registry"]
    )
    .unwrap()
});

pub static ADVERTISED_KEYS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tracker_advertised_keys",
        "Total keys advertised on the last full pass",
        &["registry"]
    )
    .unwrap()
});

pub fn render() -> String {
    use prometheus::Encoder;
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        log::error!("metrics encode failed {e:?}");
    }
    String::from_utf8(buf).unwrap_or_default()
}
