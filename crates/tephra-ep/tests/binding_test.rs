//! Binding edge cases: empty tensors, data-dependent output shapes, and
//! element-type adaptation on capability-limited devices.

mod common;

use common::*;
use std::sync::Arc;
use tephra_accel::sim::SimBackend;
use tephra_accel::Capabilities;
use tephra_graph::DataType;

/// A zero-batch call executes and produces an empty output with the
/// right shape instead of failing on null addresses.
#[test]
fn empty_tensors_bind_and_run() {
    let backend = Arc::new(SimBackend::new());
    let provider = provider(&backend, &[]);
    provider
        .compile_subgraph(dynamic_relu_graph())
        .expect("registration");

    let mut kernel = kernel(&backend);
    kernel
        .set_input("x", DataType::F32, vec![0, 2], &[])
        .expect("empty input");
    provider.run("relu_sub", &mut kernel).expect("empty call");

    let out = kernel.output("y").expect("output tensor");
    assert_eq!(out.dims, vec![0, 2]);
    assert!(kernel.read_output("y").expect("read").is_empty());
}

/// Data-dependent output shapes come back through the persistent output
/// allocator, with the final shape known only after execution.
#[test]
fn data_dependent_output_reports_its_shape() {
    let backend = Arc::new(SimBackend::new());
    let provider = provider(&backend, &[]);
    provider
        .compile_subgraph(nonzero_graph())
        .expect("registration");

    let mut kernel = kernel(&backend);
    kernel
        .set_input("x", DataType::F32, vec![4], &f32_bytes(&[0.0, 1.0, 2.0, 0.0]))
        .expect("input");
    provider.run("nonzero_sub", &mut kernel).expect("call");
    let out = kernel.output("idx").expect("output tensor");
    assert_eq!(out.dims, vec![1, 2]);
    assert_eq!(
        as_i64s(&kernel.read_output("idx").expect("read")),
        vec![1, 2]
    );

    // A second call with fewer hits shrinks the reported shape; the
    // allocator's backing buffer is reused across calls.
    let mut kernel = common::kernel(&backend);
    kernel
        .set_input("x", DataType::F32, vec![4], &f32_bytes(&[0.0, 0.0, 5.0, 0.0]))
        .expect("input");
    provider.run("nonzero_sub", &mut kernel).expect("second call");
    assert_eq!(kernel.output("idx").expect("output tensor").dims, vec![1, 1]);
    assert_eq!(as_i64s(&kernel.read_output("idx").expect("read")), vec![2]);
}

fn no_int64_backend() -> Arc<SimBackend> {
    Arc::new(SimBackend::with_capabilities(Capabilities {
        fast_fp16: true,
        fast_int8: true,
        native_int64: false,
        native_double: true,
        hardware_compat: true,
        compute_capability: "86".to_string(),
    }))
}

/// On a device without native i64 the compiler narrows the boundary
/// tensors and the binder casts both directions; the caller still sees
/// i64 data.
#[test]
fn i64_tensors_are_cast_on_narrow_devices() {
    let backend = no_int64_backend();
    let provider = provider(&backend, &[]);
    provider
        .compile_subgraph(identity_i64_graph())
        .expect("registration");

    let mut kernel = kernel(&backend);
    kernel
        .set_input("x", DataType::I64, vec![2], &i64_bytes(&[5, -3]))
        .expect("input");
    provider.run("identity_sub", &mut kernel).expect("call");

    let out = kernel.output("y").expect("output tensor");
    assert_eq!(out.dtype, DataType::I64);
    assert_eq!(as_i64s(&kernel.read_output("y").expect("read")), vec![5, -3]);
}

/// int8 mode without a calibration table still builds and runs; the
/// engine is merely uncalibrated.
#[test]
fn int8_without_calibration_still_runs() {
    let backend = Arc::new(SimBackend::new());
    let provider = provider(&backend, &[("int8_enable", "1")]);
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
    provider.run("matmul_sub", &mut kernel).expect("call");
    assert_eq!(
        as_f32s(&kernel.read_output("y").expect("read")),
        vec![1.0, 2.0, 3.0, 6.0, 4.0, 5.0, 6.0, 15.0]
    );
}

/// Context-memory sharing routes every execution context through one
/// provider-owned arena without changing results.
#[test]
fn shared_context_memory_produces_identical_results() {
    let backend = Arc::new(SimBackend::new());
    let provider = provider(&backend, &[("context_memory_sharing_enable", "1")]);
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
    provider.run("matmul_sub", &mut kernel).expect("call");
    assert_eq!(
        as_f32s(&kernel.read_output("y").expect("read")),
        vec![1.0, 2.0, 3.0, 6.0, 4.0, 5.0, 6.0, 15.0]
    );
}
