use std::sync::LazyLock;

use prometheus::*;

static METRIC_EMBEDDED_IMAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("clip_embedded_images", "count of images embedded by the model")
        .unwrap()
});

static METRIC_SKIPPED_IMAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("clip_skipped_images", "count of images skipped because of decode errors")
        .unwrap()
});

static METRIC_INDEX_RUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("clip_index_runs", "count of completed index runs").unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "clip_search_duration",
        "duration of the per-query search in seconds",
        &["mode"]
    )
    .unwrap()
});

static METRIC_SEARCH_MAX_SCORE: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "clip_search_max_score",
        "max cosine similarity of the per-query search",
        &["mode"],
        (-10..=10).map(|x| x as f64 / 10.).collect()
    )
    .unwrap()
});

pub fn inc_embedded_images(count: usize) {
    METRIC_EMBEDDED_IMAGES.inc_by(count as u64);
}

pub fn inc_skipped_images() {
    METRIC_SKIPPED_IMAGES.inc();
}

pub fn inc_index_runs() {
    METRIC_INDEX_RUNS.inc();
}

/// 记录一次搜索的耗时和最高分，`mode` 为 text / image / file
pub fn observe_search(mode: &str, duration: f32, max_score: Option<f32>) {
    METRIC_SEARCH_DURATION.with_label_values(&[mode]).observe(duration as f64);
    if let Some(score) = max_score {
        METRIC_SEARCH_MAX_SCORE.with_label_values(&[mode]).observe(score as f64);
    }
}

/// 以文本格式导出当前进程的所有指标
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather()).unwrap_or_else(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_output() {
        inc_embedded_images(3);
        inc_skipped_images();
        observe_search("text", 0.01, Some(0.5));

        let text = gather_text();
        assert!(text.contains("clip_embedded_images"));
        assert!(text.contains("clip_skipped_images"));
        assert!(text.contains("clip_search_duration"));
    }
}
