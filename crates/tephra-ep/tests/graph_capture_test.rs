//! Command-graph capture: warm-up, capture, replay, and invalidation on
//! shape change.

mod common;

use common::*;
use std::sync::Arc;
use tephra_accel::sim::SimBackend;
use tephra_graph::DataType;

const EXPECTED: [f32; 8] = [1.0, 2.0, 3.0, 6.0, 4.0, 5.0, 6.0, 15.0];

/// The first call warms up, the second captures and replays, and later
/// calls replay the recorded graph with identical results.
#[test]
fn capture_replays_after_warmup() {
    let backend = Arc::new(SimBackend::new());
    let provider = provider(&backend, &[("graph_capture_enable", "1")]);
    provider
        .compile_subgraph(matmul_graph())
        .expect("registration");

    // One context across calls keeps input and output addresses stable,
    // which replay depends on.
    let mut kernel = kernel(&backend);
    kernel
        .set_input(
            "x",
            DataType::F32,
            vec![2, 3],
            &f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        )
        .expect("input");

    provider.run("matmul_sub", &mut kernel).expect("warm-up");
    assert!(!provider.replayed_capture("matmul_sub"));
    assert_eq!(as_f32s(&kernel.read_output("y").expect("read")), EXPECTED);

    provider.run("matmul_sub", &mut kernel).expect("capturing call");
    assert!(provider.replayed_capture("matmul_sub"));
    assert_eq!(as_f32s(&kernel.read_output("y").expect("read")), EXPECTED);

    provider.run("matmul_sub", &mut kernel).expect("replay");
    assert!(provider.replayed_capture("matmul_sub"));
    assert_eq!(as_f32s(&kernel.read_output("y").expect("read")), EXPECTED);
}

/// A shape change throws the captured graph away and falls back to a
/// regular launch before any re-capture.
#[test]
fn shape_change_invalidates_the_capture() {
    let backend = Arc::new(SimBackend::new());
    let provider = provider(&backend, &[("graph_capture_enable", "1")]);
    provider
        .compile_subgraph(dynamic_relu_graph())
        .expect("registration");

    let mut kernel = kernel(&backend);
    kernel
        .set_input("x", DataType::F32, vec![2, 2], &f32_bytes(&[-1.0, 1.0, -2.0, 2.0]))
        .expect("input");
    provider.run("relu_sub", &mut kernel).expect("warm-up");
    provider.run("relu_sub", &mut kernel).expect("capturing call");
    assert!(provider.replayed_capture("relu_sub"));

    // Different batch: must not replay the stale recording.
    let mut kernel = common::kernel(&backend);
    kernel
        .set_input("x", DataType::F32, vec![1, 2], &f32_bytes(&[-5.0, 5.0]))
        .expect("input");
    provider.run("relu_sub", &mut kernel).expect("new shape");
    assert!(!provider.replayed_capture("relu_sub"));
    assert_eq!(
        as_f32s(&kernel.read_output("y").expect("read")),
        vec![0.0, 5.0]
    );
}

/// Shapes alone do not identify a call: a second kernel context brings
/// its own device buffers, and replaying the recorded graph against the
/// first context's addresses would leave them untouched.
#[test]
fn fresh_buffers_invalidate_the_capture() {
    let backend = Arc::new(SimBackend::new());
    let provider = provider(&backend, &[("graph_capture_enable", "1")]);
    provider
        .compile_subgraph(matmul_graph())
        .expect("registration");

    let mut first = kernel(&backend);
    first
        .set_input(
            "x",
            DataType::F32,
            vec![2, 3],
            &f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        )
        .expect("input");
    provider.run("matmul_sub", &mut first).expect("warm-up");
    provider.run("matmul_sub", &mut first).expect("capturing call");
    assert!(provider.replayed_capture("matmul_sub"));

    let mut second = kernel(&backend);
    second
        .set_input("x", DataType::F32, vec![2, 3], &f32_bytes(&[1.0; 6]))
        .expect("input");
    provider
        .run("matmul_sub", &mut second)
        .expect("call with new buffers");
    assert!(!provider.replayed_capture("matmul_sub"));
    assert_eq!(
        as_f32s(&second.read_output("y").expect("read")),
        vec![1.0, 1.0, 1.0, 3.0, 1.0, 1.0, 1.0, 3.0]
    );
    // The first context's result is not overwritten by the new call.
    assert_eq!(as_f32s(&first.read_output("y").expect("read")), EXPECTED);
}

/// Capture stays off when the option is not set.
#[test]
fn no_capture_without_the_option() {
    let backend = Arc::new(SimBackend::new());
    let provider = provider(&backend, &[]);
    provider
        .compile_subgraph(matmul_graph())
        .expect("registration");

    let mut kernel = kernel(&backend);
    kernel
        .set_input(
            "x",
            DataType::F32,
            vec![2, 3],
            &f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        )
        .expect("input");
    for _ in 0..3 {
        provider.run("matmul_sub", &mut kernel).expect("call");
        assert!(!provider.replayed_capture("matmul_sub"));
    }
    assert_eq!(as_f32s(&kernel.read_output("y").expect("read")), EXPECTED);
}
