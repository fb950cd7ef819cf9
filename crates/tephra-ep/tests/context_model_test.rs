//! Context models: running prebuilt engines without the source graph.

mod common;

use common::*;
use std::sync::Arc;
use tephra_accel::sim::SimBackend;
use tephra_accel::Capabilities;
use tephra_ep::{write_context_model, ContextEngine, ContextModel, EpError};
use tephra_graph::DataType;

const EXPECTED: [f32; 8] = [1.0, 2.0, 3.0, 6.0, 4.0, 5.0, 6.0, 15.0];

fn run_matmul(backend: &Arc<SimBackend>, provider: &tephra_ep::ExecutionProvider) -> Vec<f32> {
    let mut kernel = kernel(backend);
    kernel
        .set_input(
            "x",
            DataType::F32,
            vec![2, 3],
            &f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        )
        .expect("input");
    provider.run("matmul_sub", &mut kernel).expect("call");
    as_f32s(&kernel.read_output("y").expect("read"))
}

/// Embed mode 1: the engine travels inside the context model file and a
/// fresh provider runs it without ever seeing the graph.
#[test]
fn embedded_context_model_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model_path = dir.path().join("matmul_ctx.json");
    let backend = Arc::new(SimBackend::new());

    let path_str = model_path.display().to_string();
    let builder = provider(
        &backend,
        &[
            ("ep_context_enable", "1"),
            ("ep_context_embed_mode", "1"),
            ("ep_context_file_path", path_str.as_str()),
        ],
    );
    builder.compile_subgraph(matmul_graph()).expect("registration");
    assert!(model_path.exists());
    drop(builder);

    let loader = provider(&backend, &[]);
    loader
        .compile_from_context_model(&model_path)
        .expect("loading context model");
    assert_eq!(loader.build_count("matmul_sub"), 0);
    assert_eq!(run_matmul(&backend, &loader), EXPECTED);
}

/// Embed mode 0: the context model references the engine cache file by
/// name, so a loader pointed at the same cache directory finds it.
#[test]
fn referenced_context_model_resolves_through_the_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(SimBackend::new());

    let dir_str = dir.path().display().to_string();
    let builder = provider(
        &backend,
        &[
            ("engine_cache_enable", "1"),
            ("engine_cache_path", dir_str.as_str()),
            ("ep_context_enable", "1"),
            ("ep_context_embed_mode", "0"),
        ],
    );
    builder.compile_subgraph(matmul_graph()).expect("registration");
    let model_path = dir.path().join("matmul_sub_ctx.json");
    assert!(model_path.exists());
    drop(builder);

    let loader = provider(&backend, &[("engine_cache_path", dir_str.as_str())]);
    loader
        .compile_from_context_model(&model_path)
        .expect("loading context model");
    assert_eq!(run_matmul(&backend, &loader), EXPECTED);
}

/// An engine built for a different compute capability is rejected at
/// load unless it was built hardware-compatible.
#[test]
fn compute_capability_mismatch_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model_path = dir.path().join("alien_ctx.json");
    write_context_model(
        &model_path,
        &ContextModel {
            fused_name: "alien_sub".to_string(),
            compute_capability: "90".to_string(),
            hardware_compatible: false,
            engine: ContextEngine::Embedded(Vec::new()),
        },
    )
    .expect("writing model");

    let backend = Arc::new(SimBackend::new());
    let loader = provider(&backend, &[]);
    assert!(matches!(
        loader.compile_from_context_model(&model_path),
        Err(EpError::Validation(_))
    ));
}

/// Hardware-compatible engines built on an older device load on a newer
/// one through the context model path.
#[test]
fn hardware_compatible_model_loads_on_newer_device() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model_path = dir.path().join("matmul_ctx.json");
    let old = Arc::new(SimBackend::with_capabilities(Capabilities {
        fast_fp16: true,
        fast_int8: true,
        native_int64: true,
        native_double: true,
        hardware_compat: true,
        compute_capability: "80".to_string(),
    }));

    let path_str = model_path.display().to_string();
    let builder = provider(
        &old,
        &[
            ("engine_hw_compatible", "1"),
            ("ep_context_enable", "1"),
            ("ep_context_embed_mode", "1"),
            ("ep_context_file_path", path_str.as_str()),
        ],
    );
    builder.compile_subgraph(matmul_graph()).expect("registration");
    drop(builder);

    let newer = Arc::new(SimBackend::new());
    let loader = provider(&newer, &[]);
    loader
        .compile_from_context_model(&model_path)
        .expect("loading on newer device");
    assert_eq!(run_matmul(&newer, &loader), EXPECTED);
}

/// A context model holding a weight-stripped engine cannot be loaded;
/// refit weights only exist on the graph path.
#[test]
fn stripped_engine_in_context_model_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(SimBackend::new());

    let dir_str = dir.path().display().to_string();
    let builder = provider(
        &backend,
        &[
            ("engine_cache_enable", "1"),
            ("engine_cache_path", dir_str.as_str()),
            ("weight_stripped_engine_enable", "1"),
        ],
    );
    builder.compile_subgraph(matmul_graph()).expect("registration");
    drop(builder);

    // Wrap the stripped blob in a context model by hand.
    let stripped = std::fs::read(dir.path().join("matmul_sub_sm86.stripped.engine"))
        .expect("stripped engine");
    let model_path = dir.path().join("stripped_ctx.json");
    write_context_model(
        &model_path,
        &ContextModel {
            fused_name: "matmul_stripped".to_string(),
            compute_capability: "86".to_string(),
            hardware_compatible: false,
            engine: ContextEngine::Embedded(stripped),
        },
    )
    .expect("writing model");

    let loader = provider(&backend, &[]);
    assert!(matches!(
        loader.compile_from_context_model(&model_path),
        Err(EpError::Build(_))
    ));
}
