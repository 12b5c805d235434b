//! Shared fixtures for scheduler tests

use nexus_profile::ModelDatabase;
use std::path::Path;

pub(crate) const GIB: u64 = 1 << 30;

/// Linear-latency profile text in the profiler's file format
pub(crate) fn profile_text(
    profile_id: &str,
    gpu: &str,
    max_batch: u32,
    base_us: f64,
    slope_us: f64,
    base_mem: u64,
    mem_slope: u64,
) -> String {
    let mut text = format!("{}\n{}\nForward latency\nbatch,latency(us),std(us),memory(B)\n", profile_id, gpu);
    for b in 1..=max_batch {
        text.push_str(&format!(
            "{},{},0,{}\n",
            b,
            base_us + slope_us * b as f64,
            base_mem + mem_slope * b as u64
        ));
    }
    text.push_str("Preprocess latency(us): 1000,0\n");
    text.push_str("Postprocess latency(us): 500,0\n");
    text
}

const MODEL_DB: &str = "\
models:
  - framework: tensorflow
    model_name: resnet_50
    version: 1
    type: classification
  - framework: tensorflow
    model_name: resnet_101
    version: 1
    type: classification
  - framework: darknet
    model_name: yolo9000
    version: 1
    type: detection
  - framework: tensorflow
    model_name: bigmodel
    version: 1
    type: classification
  - framework: tensorflow
    model_name: inception
    version: 1
    type: classification
    resizable: true
    image_height: 299
    image_width: 299
prefix_share:
  - [\"tensorflow:resnet_50:1\", \"tensorflow:resnet_101:1\"]
";

/// Write a model database under `root` and load it.
///
/// All models run with forward latency `8000 + 2000 * batch` microseconds
/// on GPU_A (about 333 req/s peak at batch 8 under a 100 ms SLA) and
/// roughly 2 GiB of memory at the largest batch; `bigmodel` needs 20 GiB.
pub(crate) fn setup_model_db(root: &Path) -> ModelDatabase {
    std::fs::create_dir_all(root.join("db")).unwrap();
    std::fs::write(root.join("db").join("model_db.yml"), MODEL_DB).unwrap();

    let gpu_a = root.join("profile").join("GPU_A");
    std::fs::create_dir_all(&gpu_a).unwrap();
    for profile_id in [
        "tensorflow:resnet_50:1",
        "tensorflow:resnet_101:1",
        "darknet:yolo9000:1",
    ] {
        std::fs::write(
            gpu_a.join(format!("{}.txt", profile_id)),
            profile_text(profile_id, "GPU_A", 8, 8_000.0, 2_000.0, GIB, GIB / 8),
        )
        .unwrap();
    }
    std::fs::write(
        gpu_a.join("tensorflow:bigmodel:1.txt"),
        profile_text("tensorflow:bigmodel:1", "GPU_A", 8, 8_000.0, 2_000.0, 20 * GIB, 0),
    )
    .unwrap();
    std::fs::write(
        gpu_a.join("tensorflow:inception:1:299x299.txt"),
        profile_text(
            "tensorflow:inception:1:299x299",
            "GPU_A",
            8,
            8_000.0,
            2_000.0,
            GIB,
            GIB / 8,
        ),
    )
    .unwrap();

    ModelDatabase::init(root).unwrap()
}
