//! End-to-end numeric scenarios executed through full topology
//! compilation on the reference device.

use oxidnn::program::BuildOptions;
use oxidnn::tensor::{Format, Layout, TensorShape};
use oxidnn::topology::*;
use oxidnn::types::DataType;
use oxidnn::{Engine, EngineConfig, Memory, Network, Topology};

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

fn attach(engine: &Engine, layout: &Layout, values: &[f32]) -> Memory {
    engine.attach(layout.clone(), values).unwrap()
}

fn assert_close(actual: &[f32], expected: &[f32], eps: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < eps, "element {i}: got {a}, expected {e}");
    }
}

#[test]
fn eltwise_sum_yxfb() {
    let engine = engine();
    let layout = f32_layout(Format::Yxfb, 2, 2, 2, 2);
    let a = [
        1.0f32, 0.0, 5.0, 1.5, 2.0, 0.0, 6.0, 5.2, 3.0, 0.5, 7.0, 12.0, 4.0, -0.5, 8.0, 8.0,
    ];
    let b = [
        0.5f32, 2.5, 0.5, 2.5, 5.0, 7.0, 2.0, 4.0, 15.0, 17.0, 8.0, 10.0, -2.0, 6.5, -0.5, -2.5,
    ];
    let expected = [
        1.5f32, 2.5, 5.5, 4.0, 7.0, 7.0, 8.0, 9.2, 18.0, 17.5, 15.0, 22.0, 2.0, 6.0, 7.5, 5.5,
    ];

    let mut topo = Topology::new();
    topo.add(input_desc("a", &layout)).unwrap();
    topo.add(input_desc("b", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "sum",
        PrimitiveKind::Eltwise(EltwiseParams { mode: EltwiseMode::Sum, with_activation: None }),
        vec!["a".into(), "b".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("a", attach(&engine, &layout, &a)).unwrap();
    net.set_input_data("b", attach(&engine, &layout, &b)).unwrap();
    let outputs = net.execute().unwrap();
    let out = &outputs["sum"];
    engine.wait(&[out.event.clone()]).unwrap();
    assert_close(&out.memory.read_to_vec::<f32>().unwrap(), &expected, 1e-6);
}

#[test]
fn softmax_normalize_fyx_vector() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 10, 1, 1);
    let values = [2.0f32, 2.0, 2.0, 3.0, 5.0, 4.0, 3.0, 2.0, 2.0, 2.0];
    let expected = [
        0.025700f32, 0.025700, 0.025700, 0.069859, 0.516190, 0.189896, 0.069859, 0.025700,
        0.025700, 0.025700,
    ];

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "softmax",
        PrimitiveKind::Softmax(SoftmaxParams { dimension: SoftmaxDim::Fyx }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &layout, &values)).unwrap();
    let outputs = net.execute().unwrap();
    let result = outputs["softmax"].memory.read_to_vec::<f32>().unwrap();
    assert_close(&result, &expected, 1e-5);
    let sum: f32 = result.iter().sum();
    assert!((sum - 1.0).abs() < 1e-6, "softmax group must sum to one, got {sum}");
}

#[test]
fn softmax_all_equal_is_uniform() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 2, 8, 1, 1);
    let values = vec![3.5f32; 16];

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "softmax",
        PrimitiveKind::Softmax(SoftmaxParams { dimension: SoftmaxDim::Fyx }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &layout, &values)).unwrap();
    let outputs = net.execute().unwrap();
    let result = outputs["softmax"].memory.read_to_vec::<f32>().unwrap();
    for v in result {
        assert!((v - 1.0 / 8.0).abs() < 1e-6);
    }
}

#[test]
fn mean_subtract_broadcasts_over_batch() {
    let engine = engine();
    let in_layout = f32_layout(Format::Yxfb, 2, 2, 2, 2);
    let mean_layout = f32_layout(Format::Bfyx, 1, 2, 2, 2);
    let input: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    let mean: Vec<f32> = vec![0.5, 1.5, 2.5, 3.5, -1.0, -2.0, -3.0, -4.0];

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(data_desc(&engine, "mean", &mean_layout, &mean)).unwrap();
    topo.add(PrimitiveDesc::new(
        "sub",
        PrimitiveKind::MeanSubtract(MeanSubtractParams {}),
        vec!["in".into(), "mean".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &in_layout, &input)).unwrap();
    let outputs = net.execute().unwrap();
    let result = outputs["sub"].memory.read_to_vec::<f32>().unwrap();

    for b in 0..2 {
        for f in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    let got = result[in_layout.element_offset(b, f, y, x)];
                    let want = input[in_layout.element_offset(b, f, y, x)]
                        - mean[mean_layout.element_offset(0, f, y, x)];
                    assert!((got - want).abs() < 1e-6, "mismatch at b{b} f{f} y{y} x{x}");
                }
            }
        }
    }
}

#[test]
fn crop_with_offsets() {
    let engine = engine();
    let in_layout = f32_layout(Format::Yxfb, 2, 2, 3, 2);
    let input: Vec<f32> = (0..24).map(|v| v as f32 * 1.5 - 7.0).collect();

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "crop",
        PrimitiveKind::Crop(CropParams {
            size: TensorShape::new(1, 2, 2, 1),
            offsets: TensorShape::new(1, 0, 1, 1),
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &in_layout, &input)).unwrap();
    let outputs = net.execute().unwrap();
    let out = &outputs["crop"];
    let out_layout = out.memory.layout().clone();
    let result = out.memory.read_to_vec::<f32>().unwrap();

    for f in 0..2 {
        for y in 0..2 {
            let got = result[out_layout.element_offset(0, f, y, 0)];
            let want = input[in_layout.element_offset(1, f, 1 + y, 1)];
            assert!((got - want).abs() < 1e-6, "crop mismatch at f{f} y{y}");
        }
    }
}

#[test]
fn scale_with_bias() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 2, 1, 1, 3);
    let input = [1.0f32, 2.0, -3.0, 4.0, -5.0, 6.0];
    let scale = [3.1f32, 0.2, 0.17, 10.0, -3.0, 1.0];
    let bias = [-0.1f32, 3.2, 7.0, 0.0, 1.0, -1.0];
    let expected: Vec<f32> =
        (0..6).map(|i| input[i] * scale[i] + bias[i]).collect();

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(data_desc(&engine, "scale_vals", &layout, &scale)).unwrap();
    topo.add(data_desc(&engine, "bias_vals", &layout, &bias)).unwrap();
    topo.add(PrimitiveDesc::new(
        "scaled",
        PrimitiveKind::Scale(ScaleParams {}),
        vec!["in".into(), "scale_vals".into(), "bias_vals".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &layout, &input)).unwrap();
    let outputs = net.execute().unwrap();
    assert_close(&outputs["scaled"].memory.read_to_vec::<f32>().unwrap(), &expected, 1e-5);
}

#[test]
fn prior_box_constants() {
    let engine = engine();
    let in_layout = f32_layout(Format::Bfyx, 10, 10, 10, 10);

    let mut topo = Topology::new();
    topo.add(input_desc("features", &in_layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "priors",
        PrimitiveKind::PriorBox(PriorBoxParams {
            image_size: (100, 100),
            min_sizes: vec![4.0],
            max_sizes: vec![9.0],
            aspect_ratios: vec![1.0],
            flip: false,
            clip: false,
            variance: vec![],
            step_width: 0.0,
            step_height: 0.0,
            offset: 0.5,
        }),
        vec!["features".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data(
        "features",
        attach(&engine, &in_layout, &vec![0.0f32; in_layout.physical_size()]),
    )
    .unwrap();
    let outputs = net.execute().unwrap();
    let out = &outputs["priors"];
    let layout = out.memory.layout().clone();
    assert_eq!(layout.size, TensorShape::new(1, 2, 800, 1));
    let values = out.memory.read_to_vec::<f32>().unwrap();

    // first prior: 4x4 box centred at (5, 5) over a 100x100 image
    let expected_first = [0.03f32, 0.03, 0.07, 0.07];
    for (i, e) in expected_first.iter().enumerate() {
        let got = values[layout.element_offset(0, 0, i, 0)];
        assert!((got - e).abs() < 1e-6, "prior[{i}]: got {got}, expected {e}");
    }
    // second feature plane holds the variance, defaulted to 0.1
    for i in 0..800 {
        let got = values[layout.element_offset(0, 1, i, 0)];
        assert!((got - 0.1).abs() < 1e-6, "variance[{i}] = {got}");
    }
}

#[test]
fn convolution_shape_and_values() {
    let engine = engine();
    let in_layout = f32_layout(Format::Bfyx, 1, 1, 3, 3);
    let w_layout = Layout::new(DataType::F32, Format::Oiyx, TensorShape::new(1, 1, 2, 2));
    let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(data_desc(&engine, "w", &w_layout, &[1.0, 1.0, 1.0, 1.0])).unwrap();
    topo.add(data_desc(
        &engine,
        "b",
        &f32_layout(Format::Bfyx, 1, 1, 1, 1),
        &[0.5],
    ))
    .unwrap();
    topo.add(PrimitiveDesc::new(
        "conv",
        PrimitiveKind::Convolution(ConvolutionParams {
            weights: vec!["w".into()],
            bias: vec!["b".into()],
            stride: (1, 1),
            dilation: (1, 1),
            input_offset: (0, 0),
            split: 1,
            with_activation: None,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &in_layout, &input)).unwrap();
    let outputs = net.execute().unwrap();
    let out = &outputs["conv"];
    // (3 + 0 - 2) / 1 + 1 = 2 per spatial axis
    assert_eq!(out.memory.layout().size, TensorShape::new(1, 1, 2, 2));
    assert_close(
        &out.memory.read_to_vec::<f32>().unwrap(),
        &[12.5, 16.5, 24.5, 28.5],
        1e-6,
    );
}

#[test]
fn grouped_convolution_splits_features() {
    let engine = engine();
    let in_layout = f32_layout(Format::Bfyx, 1, 2, 2, 2);
    let w_layout = Layout::new(DataType::F32, Format::Oiyx, TensorShape::new(1, 1, 1, 1));
    let input: Vec<f32> = (1..=8).map(|v| v as f32).collect();

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(data_desc(&engine, "w0", &w_layout, &[2.0])).unwrap();
    topo.add(data_desc(&engine, "w1", &w_layout, &[3.0])).unwrap();
    topo.add(PrimitiveDesc::new(
        "grouped",
        PrimitiveKind::Convolution(ConvolutionParams {
            weights: vec!["w0".into(), "w1".into()],
            bias: vec![],
            stride: (1, 1),
            dilation: (1, 1),
            input_offset: (0, 0),
            split: 2,
            with_activation: None,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &in_layout, &input)).unwrap();
    let outputs = net.execute().unwrap();
    let result = outputs["grouped"].memory.read_to_vec::<f32>().unwrap();
    // split 0 scales feature 0 by 2, split 1 scales feature 1 by 3
    assert_close(
        &result,
        &[2.0, 4.0, 6.0, 8.0, 15.0, 18.0, 21.0, 24.0],
        1e-6,
    );
}

#[test]
fn fused_relu_clamps_negative_accumulators() {
    let engine = engine();
    let in_layout = f32_layout(Format::Bfyx, 1, 1, 2, 2);
    let w_layout = Layout::new(DataType::F32, Format::Oiyx, TensorShape::new(1, 1, 1, 1));

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(data_desc(&engine, "w", &w_layout, &[1.0])).unwrap();
    topo.add(PrimitiveDesc::new(
        "conv",
        PrimitiveKind::Convolution(ConvolutionParams {
            weights: vec!["w".into()],
            bias: vec![],
            stride: (1, 1),
            dilation: (1, 1),
            input_offset: (0, 0),
            split: 1,
            with_activation: Some(ActivationInfo::relu()),
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &in_layout, &[-1.0, 2.0, -3.0, 4.0])).unwrap();
    let outputs = net.execute().unwrap();
    assert_close(
        &outputs["conv"].memory.read_to_vec::<f32>().unwrap(),
        &[0.0, 2.0, 0.0, 4.0],
        1e-6,
    );
}

#[test]
fn fully_connected_with_bias() {
    let engine = engine();
    let in_layout = f32_layout(Format::Bfyx, 1, 2, 1, 1);
    let w_layout = Layout::new(DataType::F32, Format::Oiyx, TensorShape::new(2, 2, 1, 1));

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(data_desc(&engine, "w", &w_layout, &[1.0, 2.0, 3.0, 4.0])).unwrap();
    topo.add(data_desc(&engine, "b", &f32_layout(Format::Bfyx, 2, 1, 1, 1), &[0.5, -0.5]))
        .unwrap();
    topo.add(PrimitiveDesc::new(
        "fc",
        PrimitiveKind::FullyConnected(FullyConnectedParams {
            weights: "w".into(),
            bias: Some("b".into()),
            with_activation: None,
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &in_layout, &[10.0, 20.0])).unwrap();
    let outputs = net.execute().unwrap();
    assert_close(
        &outputs["fc"].memory.read_to_vec::<f32>().unwrap(),
        &[50.5, 109.5],
        1e-5,
    );
}

#[test]
fn max_pooling() {
    let engine = engine();
    let in_layout = f32_layout(Format::Bfyx, 1, 1, 4, 4);
    let input: Vec<f32> = (1..=16).map(|v| v as f32).collect();

    let mut topo = Topology::new();
    topo.add(input_desc("in", &in_layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "pool",
        PrimitiveKind::Pooling(PoolingParams {
            mode: PoolingMode::Max,
            size: (2, 2),
            stride: (2, 2),
            input_offset: (0, 0),
        }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &in_layout, &input)).unwrap();
    let outputs = net.execute().unwrap();
    assert_close(
        &outputs["pool"].memory.read_to_vec::<f32>().unwrap(),
        &[6.0, 8.0, 14.0, 16.0],
        1e-6,
    );
}

#[test]
fn eltwise_max_is_idempotent() {
    let engine = engine();
    let layout = f32_layout(Format::Bfyx, 1, 1, 2, 2);
    let values = [1.0f32, -2.0, 3.0, -4.0];

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "max",
        PrimitiveKind::Eltwise(EltwiseParams { mode: EltwiseMode::Max, with_activation: None }),
        vec!["in".into(), "in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", attach(&engine, &layout, &values)).unwrap();
    let outputs = net.execute().unwrap();
    assert_close(&outputs["max"].memory.read_to_vec::<f32>().unwrap(), &values, 0.0);
}

#[test]
fn softmax_f16_tolerance() {
    let engine = engine();
    let layout = Layout::new(DataType::F16, Format::Bfyx, TensorShape::new(1, 4, 1, 1));
    let values: Vec<half::f16> =
        [1.0f32, 2.0, 3.0, 4.0].iter().map(|v| half::f16::from_f32(*v)).collect();

    let mut topo = Topology::new();
    topo.add(input_desc("in", &layout)).unwrap();
    topo.add(PrimitiveDesc::new(
        "softmax",
        PrimitiveKind::Softmax(SoftmaxParams { dimension: SoftmaxDim::Fyx }),
        vec!["in".into()],
    ))
    .unwrap();

    let mut net = Network::build(&engine, &topo, &BuildOptions::default()).unwrap();
    net.set_input_data("in", engine.attach(layout.clone(), &values).unwrap()).unwrap();
    let outputs = net.execute().unwrap();
    let result = outputs["softmax"].memory.read_to_vec::<half::f16>().unwrap();
    let sum: f32 = result.iter().map(|v| v.to_f32()).sum();
    assert!((sum - 1.0).abs() < 1e-3, "f16 softmax sum {sum}");
    for v in result {
        let v = v.to_f32();
        assert!((0.0..=1.0).contains(&v));
    }
}
