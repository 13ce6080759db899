//! Execution-engine behaviour: determinism, reorder round trips, the two
//! submission modes, user events, profiling, and the remaining operator
//! semantics checked against hand-computed values.

use oxidnn::program::BuildOptions;
use oxidnn::tensor::{Axis, Format, Layout, TensorShape};
use oxidnn::topology::*;
use oxidnn::types::DataType;
use oxidnn::{Engine, EngineConfig, Network, Topology};

fn engine() -> Engine {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Engine::host(EngineConfig::default())
}

fn f32_layout(format: Format, b: usize, f: usize, y: usize, x: usize) -> Layout {
    Layout::new(DataType::F32, format, TensorShape::new(b, f, y, x))
}

fn input_desc(id: &str, layout: &Layout) -> PrimitiveDesc {
    PrimitiveDesc::new(
        id,
        PrimitiveKind::InputLayout(InputLayoutParams { layout: layout.clone() }),
        vec![],
    )
}

fn data_desc(engine: &Engine, id: &str, layout: &Layout, values: &[f32]) -> PrimitiveDesc {
    let memory = engine.attach(layout.clone(), values).unwrap();
    PrimitiveDesc::new(id, PrimitiveKind::Data(DataParams { memory }), vec![])
}

fn assert_close(actual: &[f32], expected: &[f32], eps: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < eps, "element {i}: got {a}, expected {e}");
    }
}

#[test]
fn reorder_round_trip_is_bit_exact() {
    use rand::Rng;
    let engine = engine();
    let bfyx = f32_layout(Format::Bfyx, 2, 3, 4, 5);
    let mut rng = rand::thread_rng();
    let values: Vec<f32> = (0..bfyx.logical_size()).map(|_| rng.gen_range(-10.0..10.0)).collect();

    let mut topo = Topology::new();
    topo.add(input_desc("in", &bfyx)).unwrap();
    topo.add(PrimitiveDesc::new(
        "there",
        PrimitiveKind::Reorder(ReorderParams {
            output_layout: bfyx.transform(Format::Yxfb),
            subtract: ReorderSubtract::None,
        }),
        vec!["in".into()],
    ))
    .unwrap();
    topo.add(PrimitiveDesc::new(
        "back",
        PrimitiveKind::Reorder(ReorderParams {
            output_layout: bfyx.clone(),
            subtract: ReorderSubtract::None,
        }),
        vec!["there".into()],
    ))
    .unwrap();

    // no optimisation: both reorders actually run
    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(bfyx, &values).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    let round = outputs["back"].memory.read_to_vec::<f32>().unwrap();
    for (a, b) in values.iter().zip(&round) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn two_executions_are_bit_identical() {
    let engine = engine();
    let in_layout = f32_layout(Format::Bfyx, 1, 1, 3, 3);
    let w_layout = Layout::new(DataType::F32, Format::Oiyx, TensorShape::new(4, 1, 2, 2));
    let weights: Vec<f32> = (0..16).map(|v| (v as f32) * 0.37 - 2.1).collect();
    let input: Vec<f32> = (0..9).map(|v| (v as f32) * 1.11 - 4.0).collect();

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(data_desc(&engine, "w", &w_layout, &weights)).unwrap();
    topo.add(PrimitiveDesc::new(
        "conv",
        PrimitiveKind::Convolution(ConvolutionParams {
            weights: vec!["w".into()],
            bias: vec![],
            stride: (1, 1),
            dilation: (1, 1),
            input_offset: (0, 0),
            split: 1,
            with_activation: None,
        }),
        vec!["in".into()],
    ))
    .unwrap();
    topo.add(PrimitiveDesc::new(
        "softmax",
        PrimitiveKind::Softmax(SoftmaxParams { dimension: SoftmaxDim::Fyx }),
        vec!["conv".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(in_layout.clone(), &input).unwrap()).unwrap();
    let first: Vec<u32> = net.execute().unwrap()["softmax"]
        .memory
        .read_to_vec::<f32>()
        .unwrap()
        .iter()
        .map(|v| v.to_bits())
        .collect();
    net.set_input_data("in", engine.attach(in_layout, &input).unwrap()).unwrap();
    let second: Vec<u32> = net.execute().unwrap()["softmax"]
        .memory
        .read_to_vec::<f32>()
        .unwrap()
        .iter()
        .map(|v| v.to_bits())
        .collect();
    assert_eq!(first, second);
}

#[test]
fn out_of_order_mode_matches_in_order_results() {
    let run = |config: EngineConfig| -> Vec<f32> {
        let engine = Engine::host(config);
        let layout = f32_layout(Format::Bfyx, 1, 2, 2, 2);
        let mut topo = Topology::new();
        topo.add(input_desc("in", &layout)).unwrap();
        topo.add(PrimitiveDesc::new(
            "relu",
            PrimitiveKind::Activation(ActivationParams { info: ActivationInfo::relu() }),
            vec!["in".into()],
        ))
        .unwrap();
        topo.add(PrimitiveDesc::new(
            "sig",
            PrimitiveKind::Activation(ActivationParams {
                info: ActivationInfo { func: ActivationFunc::Sigmoid, slope: 0.0 },
            }),
            vec!["in".into()],
        ))
        .unwrap();
        topo.add(PrimitiveDesc::new(
            "sum",
            PrimitiveKind::Eltwise(EltwiseParams {
                mode: EltwiseMode::Sum,
                with_activation: None,
            }),
            vec!["relu".into(), "sig".into()],
        ))
        .unwrap();

        let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
        let values = [-2.0f32, -1.0, 1.0, 2.0, -0.5, 0.5, 3.0, -3.0];
        net.set_input_data("in", engine.attach(layout, &values).unwrap()).unwrap();
        let outputs = net.execute().unwrap();
        engine.wait(&[outputs["sum"].event.clone()]).unwrap();
        outputs["sum"].memory.read_to_vec::<f32>().unwrap()
    };

    let in_order = run(EngineConfig::default());
    let out_of_order = run(EngineConfig { host_out_of_order: true, ..Default::default() });
    assert_close(&in_order, &out_of_order, 0.0);
}

#[test]
fn user_event_gates_input_readiness() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 1, 1, 3);
    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "relu",
        PrimitiveKind::Activation(ActivationParams { info: ActivationInfo::relu() }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    let memory = engine.attach(layout, &[-1.0f32, 0.0, 1.0]).unwrap();
    let ready = engine.create_user_event();
    net.set_input("in", memory, ready.clone()).unwrap();
    // the reference queue drains dependencies synchronously, so the
    // signal must precede execute
    ready.set().unwrap();
    let outputs = net.execute().unwrap();
    assert_eq!(outputs["relu"].memory.read_to_vec::<f32>().unwrap(), vec![0.0, 0.0, 1.0]);
}

#[test]
fn profiling_intervals_reach_network_outputs() {
    let engine = Engine::host(EngineConfig { enable_profiling: true, ..Default::default() });
    let layout = f32_layout(Format::Bfyx, 1, 1, 1, 4);
    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "relu",
        PrimitiveKind::Activation(ActivationParams { info: ActivationInfo::relu() }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout, &[1.0f32, 2.0, 3.0, 4.0]).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    let intervals = outputs["relu"].event.profiling_intervals().expect("profiling on");
    assert_eq!(intervals.len(), 3);
    assert!(intervals.iter().any(|i| i.name == "executing"));
}

#[test]
fn arg_max_along_x() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 1, 1, 5);
    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "top2",
        PrimitiveKind::ArgMaxMin(ArgMaxMinParams {
            out: ArgMaxMinOut::Max,
            axis: Some(Axis::X),
            top_k: 2,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout, &[3.0f32, 1.0, 4.0, 1.0, 5.0]).unwrap())
        .unwrap();
    let outputs = net.execute().unwrap();
    assert_eq!(outputs["top2"].memory.read_to_vec::<f32>().unwrap(), vec![4.0, 2.0]);
}

#[test]
fn arg_min_whole_tensor_per_batch() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 2, 2, 1, 2);
    let values = [7.0f32, 1.0, 2.0, 9.0, 0.0, 5.0, 6.0, 2.0];

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "argmin",
        PrimitiveKind::ArgMaxMin(ArgMaxMinParams {
            out: ArgMaxMinOut::Min,
            axis: None,
            top_k: 1,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout, &values).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    // batch 0 minimum 1.0 at flattened index 1; batch 1 minimum 0.0 at 0
    assert_eq!(outputs["argmin"].memory.read_to_vec::<f32>().unwrap(), vec![1.0, 0.0]);
}

#[test]
fn lookup_table_gathers_argmax_values() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 2, 2, 1, 2);
    let values = [7.0f32, 1.0, 2.0, 9.0, 0.0, 5.0, 6.0, 2.0];

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "argmax",
        PrimitiveKind::ArgMaxMin(ArgMaxMinParams {
            out: ArgMaxMinOut::Max,
            axis: None,
            top_k: 1,
        }),
        vec!["in".into()],
    ))
    .unwrap();
    topo.add(PrimitiveDesc::new(
        "best_values",
        PrimitiveKind::LookupTable(LookupTableParams { axis: None }),
        vec!["in".into(), "argmax".into()],
    ))
    .unwrap();

    let options = BuildOptions { outputs: vec!["best_values".into()], ..Default::default() };
    let mut net = Network::build(&engine, &topo, &options).unwrap();
    net.set_input_data("in", engine.attach(layout, &values).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    assert_eq!(
        outputs["best_values"].memory.read_to_vec::<f32>().unwrap(),
        vec![9.0, 6.0]
    );
}

#[test]
fn index_select_along_x() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 1, 1, 4);
    let idx_layout = Layout::new(DataType::I32, Format::Bfyx, TensorShape::new(1, 1, 1, 2));
    let indices: Vec<i32> = vec![2, 0];

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "idx",
        PrimitiveKind::Data(DataParams {
            memory: engine.attach(idx_layout, &indices).unwrap(),
        }),
        vec![],
    ))
    .unwrap();
    topo.add(PrimitiveDesc::new(
        "picked",
        PrimitiveKind::IndexSelect(IndexSelectParams { axis: Axis::X }),
        vec!["in".into(), "idx".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout, &[10.0f32, 20.0, 30.0, 40.0]).unwrap())
        .unwrap();
    let outputs = net.execute().unwrap();
    assert_eq!(outputs["picked"].memory.read_to_vec::<f32>().unwrap(), vec![30.0, 10.0]);
}

#[test]
fn permute_swaps_spatial_axes() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 1, 2, 3);
    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "transposed",
        PrimitiveKind::Permute(PermuteParams { order: [0, 1, 3, 2] }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data(
        "in",
        engine.attach(layout, &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
    )
    .unwrap();
    let outputs = net.execute().unwrap();
    let out = &outputs["transposed"];
    assert_eq!(out.memory.layout().size, TensorShape::new(1, 1, 3, 2));
    assert_eq!(
        out.memory.read_to_vec::<f32>().unwrap(),
        vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
    );
}

#[test]
fn upsampling_nearest_doubles_pixels() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 1, 2, 2);
    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "up",
        PrimitiveKind::Upsampling(UpsamplingParams { scale: 2, mode: UpsampleMode::Nearest }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout, &[1.0f32, 2.0, 3.0, 4.0]).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    assert_eq!(
        outputs["up"].memory.read_to_vec::<f32>().unwrap(),
        vec![
            1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0
        ]
    );
}

#[test]
fn batch_norm_normalises_per_feature() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 2, 1, 2);
    let stat_layout = f32_layout(Format::Bfyx, 1, 2, 1, 1);

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(data_desc(&engine, "mean", &stat_layout, &[1.0, 3.0])).unwrap();
    topo.add(data_desc(&engine, "var", &stat_layout, &[4.0, 9.0])).unwrap();
    topo.add(PrimitiveDesc::new(
        "bn",
        PrimitiveKind::BatchNorm(BatchNormParams { epsilon: 0.0 }),
        vec!["in".into(), "mean".into(), "var".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout, &[1.0f32, 2.0, 3.0, 4.0]).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    assert_close(
        &outputs["bn"].memory.read_to_vec::<f32>().unwrap(),
        &[0.0, 0.5, 0.0, 1.0 / 3.0],
        1e-6,
    );
}

#[test]
fn lrn_across_channels() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 2, 1, 1);
    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "lrn",
        PrimitiveKind::Lrn(LrnParams {
            size: 3,
            k: 1.0,
            alpha: 1.0,
            beta: 0.5,
            norm_region: LrnNorm::AcrossChannel,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout, &[3.0f32, 4.0]).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    // both features see the full 3^2 + 4^2 window: scale = (1 + 25/3)^-0.5
    let scale = (1.0f32 + 25.0 / 3.0).powf(-0.5);
    assert_close(
        &outputs["lrn"].memory.read_to_vec::<f32>().unwrap(),
        &[3.0 * scale, 4.0 * scale],
        1e-5,
    );
}

#[test]
fn normalize_l2_within_spatial() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 2, 1, 2);
    let scale_layout = f32_layout(Format::Bfyx, 1, 2, 1, 1);

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(data_desc(&engine, "factors", &scale_layout, &[2.0, 3.0])).unwrap();
    topo.add(PrimitiveDesc::new(
        "norm",
        PrimitiveKind::Normalize(NormalizeParams {
            scale: "factors".into(),
            across_spatial: false,
            epsilon: 0.0,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    // f0 = [1, 3], f1 = [2, 4]; per-column norms sqrt(5) and 5
    net.set_input_data("in", engine.attach(layout, &[1.0f32, 3.0, 2.0, 4.0]).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    let s5 = 5.0f32.sqrt();
    assert_close(
        &outputs["norm"].memory.read_to_vec::<f32>().unwrap(),
        &[1.0 / s5 * 2.0, 3.0 / 5.0 * 2.0, 2.0 / s5 * 3.0, 4.0 / 5.0 * 3.0],
        1e-5,
    );
}

#[test]
fn deconvolution_full_correlation() {
    let engine = engine();
    let in_layout = f32_layout(Format::Bfyx, 1, 1, 2, 2);
    let w_layout = Layout::new(DataType::F32, Format::Oiyx, TensorShape::new(1, 1, 2, 2));

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(data_desc(&engine, "w", &w_layout, &[1.0, 1.0, 1.0, 1.0])).unwrap();
    topo.add(PrimitiveDesc::new(
        "deconv",
        PrimitiveKind::Deconvolution(DeconvolutionParams {
            weights: vec!["w".into()],
            bias: vec![],
            stride: (1, 1),
            input_offset: (0, 0),
            split: 1,
            with_activation: None,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(in_layout, &[1.0f32, 2.0, 3.0, 4.0]).unwrap())
        .unwrap();
    let outputs = net.execute().unwrap();
    let out = &outputs["deconv"];
    assert_eq!(out.memory.layout().size, TensorShape::new(1, 1, 3, 3));
    assert_close(
        &out.memory.read_to_vec::<f32>().unwrap(),
        &[1.0, 3.0, 2.0, 4.0, 10.0, 6.0, 3.0, 7.0, 4.0],
        1e-6,
    );
}

#[test]
fn reorder_with_per_feature_subtract() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 2, 1, 2);
    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "shifted",
        PrimitiveKind::Reorder(ReorderParams {
            output_layout: layout.clone(),
            subtract: ReorderSubtract::PerFeature(vec![0.5, 1.0]),
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout, &[1.0f32, 2.0, 3.0, 4.0]).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    assert_close(
        &outputs["shifted"].memory.read_to_vec::<f32>().unwrap(),
        &[0.5, 1.5, 2.0, 3.0],
        1e-6,
    );
}

#[test]
fn reorder_with_mean_memory() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 2, 1, 2);
    let mean_layout = f32_layout(Format::Bfyx, 1, 2, 1, 1);

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(data_desc(&engine, "mean", &mean_layout, &[1.0, 2.0])).unwrap();
    topo.add(PrimitiveDesc::new(
        "centered",
        PrimitiveKind::Reorder(ReorderParams {
            output_layout: layout.clone(),
            subtract: ReorderSubtract::Mean("mean".into()),
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout, &[1.0f32, 2.0, 3.0, 4.0]).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    assert_close(
        &outputs["centered"].memory.read_to_vec::<f32>().unwrap(),
        &[0.0, 1.0, 1.0, 2.0],
        1e-6,
    );
}

#[test]
fn reorder_converts_element_type() {
    let engine = engine();
    let f32_in = f32_layout(Format::Bfyx, 1, 1, 1, 4);
    let f16_out = Layout::new(DataType::F16, Format::Bfyx, TensorShape::new(1, 1, 1, 4));

    let mut topo = Topology::new();
    topo.add(input_desc("in", &f32_in)).unwrap();
    topo.add(PrimitiveDesc::new(
        "half",
        PrimitiveKind::Reorder(ReorderParams {
            output_layout: f16_out,
            subtract: ReorderSubtract::None,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(f32_in, &[0.5f32, -1.25, 2.0, 100.0]).unwrap())
        .unwrap();
    let outputs = net.execute().unwrap();
    let halves = outputs["half"].memory.read_to_vec::<half::f16>().unwrap();
    let round: Vec<f32> = halves.iter().map(|v| v.to_f32()).collect();
    assert_close(&round, &[0.5, -1.25, 2.0, 100.0], 1e-2);
}

#[test]
fn region_yolo_applies_logistic_and_class_softmax() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 7, 1, 1);
    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "yolo",
        PrimitiveKind::RegionYolo(RegionYoloParams {
            coords: 4,
            classes: 2,
            num: 1,
            do_softmax: true,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data(
        "in",
        engine.attach(layout, &[0.0f32, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]).unwrap(),
    )
    .unwrap();
    let outputs = net.execute().unwrap();
    assert_close(
        &outputs["yolo"].memory.read_to_vec::<f32>().unwrap(),
        &[0.5, 0.5, 0.0, 0.0, 0.5, 0.5, 0.5],
        1e-6,
    );
}

#[test]
fn simpler_nms_generates_sorted_proposals() {
    let engine = engine();
    // one anchor (scale 1, ratio 1) over a 1x2 grid, stride 16: boxes of
    // 16x16 centred at x=8 and x=24 on a 32x32 image
    let scores_layout = f32_layout(Format::Bfyx, 1, 2, 1, 2);
    let bbox_layout = f32_layout(Format::Bfyx, 1, 4, 1, 2);
    let info_layout = f32_layout(Format::Bfyx, 1, 3, 1, 1);

    let mut topo = Topology::new();
    topo.add(input_desc("scores", &scores_layout)).unwrap();
    topo.add(input_desc("deltas", &bbox_layout)).unwrap();
    topo.add(data_desc(&engine, "im_info", &info_layout, &[32.0, 32.0, 1.0])).unwrap();
    topo.add(PrimitiveDesc::new(
        "proposals",
        PrimitiveKind::SimplerNms(SimplerNmsParams {
            max_proposals: 10,
            iou_threshold: 0.5,
            min_box_size: 1,
            feature_stride: 16,
            pre_nms_topn: 10,
            post_nms_topn: 2,
            scales: vec![1.0],
            ratios: vec![1.0],
        }),
        vec!["scores".into(), "deltas".into(), "im_info".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    // background scores fill the first anchor plane, foreground the second
    net.set_input_data(
        "scores",
        engine.attach(scores_layout, &[0.1f32, 0.2, 0.9, 0.8]).unwrap(),
    )
    .unwrap();
    net.set_input_data("deltas", engine.attach(bbox_layout, &[0.0f32; 8]).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    let out = &outputs["proposals"];
    assert_eq!(out.memory.layout().size, TensorShape::new(2, 1, 1, 5));
    // zero deltas keep the raw anchors; the higher-scored box comes first,
    // the second clamps its right edge to the image
    assert_close(
        &out.memory.read_to_vec::<f32>().unwrap(),
        &[0.0, 0.0, 0.0, 16.0, 16.0, 0.0, 16.0, 0.0, 31.0, 16.0],
        1e-5,
    );
}

#[test]
fn simpler_nms_suppresses_overlapping_boxes() {
    let engine = engine();
    // two identical anchors on a single cell: the lower-scored duplicate
    // must be suppressed, leaving the second output row untouched
    let scores_layout = f32_layout(Format::Bfyx, 1, 4, 1, 1);
    let bbox_layout = f32_layout(Format::Bfyx, 1, 8, 1, 1);
    let info_layout = f32_layout(Format::Bfyx, 1, 3, 1, 1);

    let mut topo = Topology::new();
    topo.add(input_desc("scores", &scores_layout)).unwrap();
    topo.add(input_desc("deltas", &bbox_layout)).unwrap();
    topo.add(data_desc(&engine, "im_info", &info_layout, &[32.0, 32.0, 1.0])).unwrap();
    topo.add(PrimitiveDesc::new(
        "proposals",
        PrimitiveKind::SimplerNms(SimplerNmsParams {
            max_proposals: 10,
            iou_threshold: 0.5,
            min_box_size: 1,
            feature_stride: 16,
            pre_nms_topn: 10,
            post_nms_topn: 2,
            scales: vec![1.0, 1.0],
            ratios: vec![1.0],
        }),
        vec!["scores".into(), "deltas".into(), "im_info".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data(
        "scores",
        engine.attach(scores_layout, &[0.1f32, 0.2, 0.9, 0.8]).unwrap(),
    )
    .unwrap();
    net.set_input_data("deltas", engine.attach(bbox_layout, &[0.0f32; 8]).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    assert_close(
        &outputs["proposals"].memory.read_to_vec::<f32>().unwrap(),
        &[0.0, 0.0, 0.0, 16.0, 16.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        1e-5,
    );
}

#[test]
fn roi_pooling_takes_window_maxima() {
    let engine = engine();
    let in_layout = f32_layout(Format::Bfyx, 1, 1, 4, 4);
    let roi_layout = f32_layout(Format::Bfyx, 1, 1, 1, 5);
    let input: Vec<f32> = (1..=16).map(|v| v as f32).collect();

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(data_desc(&engine, "rois", &roi_layout, &[0.0, 0.0, 0.0, 1.0, 1.0])).unwrap();
    topo.add(PrimitiveDesc::new(
        "pooled",
        PrimitiveKind::RoiPooling(RoiPoolingParams {
            pooled_size: (1, 1),
            spatial_scale: 1.0,
        }),
        vec!["in".into(), "rois".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(in_layout, &input).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    // the 2x2 region starting at the origin peaks at row 1, column 1
    assert_eq!(outputs["pooled"].memory.read_to_vec::<f32>().unwrap(), vec![6.0]);
}
