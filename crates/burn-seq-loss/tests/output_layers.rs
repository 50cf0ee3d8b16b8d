use burn::backend::{Autodiff, NdArray};
use burn::nn::Initializer;
use burn::tensor::{Bool, Int, Tensor, TensorData, Tolerance, ops::FloatElem};
use burn_seq_loss::layer::{OutputInput, Phase, SequenceContext, Source, SourceActivation};
use burn_seq_loss::ops::{Automata, FixedAutomata, HostBaumWelch, Operators};
use burn_seq_loss::{LossError, LossName, OutputLayerConfig, Target, TimeLimit};

type TB = NdArray<f32>;
type TAB = Autodiff<TB>;
type FT = FloatElem<TB>;

fn input<B: burn::tensor::backend::Backend>(
    features: Tensor<B, 3>,
    mask: &[bool],
    labels: Option<&[i64]>,
) -> OutputInput<B> {
    let device = features.device();
    let [time, batch, _] = features.dims();
    let index =
        Tensor::<B, 2, Bool>::from_data(TensorData::new(mask.to_vec(), [time, batch]), &device);
    let target = match labels {
        Some(labels) => Target::Labels(Tensor::<B, 2, Int>::from_data(
            TensorData::new(labels.to_vec(), [labels.len() / batch, batch]),
            &device,
        )),
        None => Target::None,
    };

    OutputInput::new(vec![Source::new(SourceActivation::Dense(features), index)], target)
}

#[test]
fn framewise_cross_entropy_trains_the_projection() {
    let device = Default::default();
    let layer = OutputLayerConfig::new(2, LossName::Ce)
        .with_initializer(Initializer::Constant { value: 0.0 })
        .init_framewise::<TAB>(&[3], &device)
        .unwrap();
    let features = Tensor::<TAB, 3>::ones([3, 1, 3], &device);

    let output = layer
        .forward(input(features, &[true, true, false], Some(&[0, 0, 1])))
        .unwrap();
    let grads = output
        .cost()
        .backward(&output.grad_targets())
        .unwrap()
        .unwrap();

    // Zero weights and a log-uniform bias give uniform posteriors.
    output
        .cost()
        .loss
        .clone()
        .unwrap()
        .into_data()
        .assert_approx_eq::<FT>(&TensorData::from([2.0 * 2.0f32.ln()]), Tolerance::default());
    layer
        .projection
        .bias
        .val()
        .grad(&grads)
        .unwrap()
        .into_data()
        .assert_approx_eq::<FT>(&TensorData::from([-1.0, 1.0]), Tolerance::default());
}

#[test]
fn time_limit_in_evaluation_counts_every_source_frame() {
    let device = Default::default();
    let layer = OutputLayerConfig::new(2, LossName::Ce)
        .with_time_limit(TimeLimit::Inf)
        .init_framewise::<TB>(&[2], &device)
        .unwrap();
    let z = Tensor::<TB, 3>::from_floats([[[2.0, 0.0]], [[0.0, 2.0]]], &device);
    let features = Tensor::<TB, 3>::zeros([2, 1, 2], &device);
    let target_index =
        Tensor::<TB, 2, Bool>::from_data(TensorData::from([[true], [false]]), &device);

    let output = layer
        .forward_logits(
            z,
            input(features, &[true, true], Some(&[0, 0]))
                .with_target_index(target_index)
                .with_phase(Phase::Eval),
        )
        .unwrap();

    output
        .base()
        .index()
        .into_data()
        .assert_eq(&TensorData::from([[1.0], [1.0]]), false);
    // One target frame against two source frames.
    assert_eq!(output.base().norm(), 0.5);
    output
        .errors()
        .unwrap()
        .unwrap()
        .into_data()
        .assert_eq(&TensorData::from([0.5]), false);
}

#[test]
fn clipped_logits_gradient_reaches_the_projection() {
    let device = Default::default();
    let layer = OutputLayerConfig::new(2, LossName::Ce)
        .with_initializer(Initializer::Constant { value: 0.0 })
        .with_grad_clip_z(Some(0.25))
        .init_framewise::<TAB>(&[3], &device)
        .unwrap();
    let features = Tensor::<TAB, 3>::ones([3, 1, 3], &device);

    let output = layer
        .forward(input(features, &[true, true, false], Some(&[0, 0, 1])))
        .unwrap();
    let grads = output
        .cost()
        .backward(&output.grad_targets())
        .unwrap()
        .unwrap();

    // Each valid frame contributes softmax - onehot = [-0.5, 0.5], clipped to 0.25.
    layer
        .projection
        .bias
        .val()
        .grad(&grads)
        .unwrap()
        .into_data()
        .assert_approx_eq::<FT>(&TensorData::from([-0.5, 0.5]), Tolerance::default());
}

#[test]
fn fast_bw_injects_the_alignment_gradient() {
    let device = Default::default();
    let operators = Operators::<TAB>::new()
        .with_forward_backward(HostBaumWelch)
        .with_automata(FixedAutomata::new(Automata::from_label_sequences(&[vec![0, 1]])));
    let layer = OutputLayerConfig::new(2, LossName::FastBw)
        .with_sprint_opts(Some("{}".into()))
        .init_sequence::<TAB>(&[2], operators, &device)
        .unwrap();
    let z = Tensor::<TAB, 3>::zeros([3, 1, 2], &device).require_grad();
    let features = Tensor::<TAB, 3>::zeros([3, 1, 2], &device);
    let context = SequenceContext::new().with_tags(vec!["recording-1".into()]);

    let output = layer
        .forward_logits(z.clone(), input(features, &[true, true, true], None), &context)
        .unwrap();
    let grads = output
        .cost()
        .backward(&output.grad_targets())
        .unwrap()
        .unwrap();

    // Paths "0 0 1" and "0 1 1" share the middle frame.
    z.grad(&grads).unwrap().into_data().assert_approx_eq::<FT>(
        &TensorData::from([[[-0.5, 0.5]], [[0.0, 0.0]], [[0.5, -0.5]]]),
        Tolerance::default(),
    );
}

#[test]
fn configuration_errors_surface_when_building_layers() {
    let device = Default::default();

    let unknown = "mpe".parse::<LossName>();
    let sprint = OutputLayerConfig::new(4, LossName::Sprint).init_sequence::<TB>(
        &[2],
        Operators::new(),
        &device,
    );
    let framewise =
        OutputLayerConfig::new(4, LossName::FastBw).init_framewise::<TB>(&[2], &device);
    let clip = OutputLayerConfig::new(4, LossName::Ce)
        .with_grad_clip_z(Some(-1.0))
        .init_framewise::<TB>(&[2], &device);

    assert!(matches!(unknown, Err(LossError::UnknownLoss(_))));
    assert!(matches!(sprint, Err(LossError::MissingOption { .. })));
    assert!(matches!(framewise, Err(LossError::InvalidLoss { .. })));
    assert!(matches!(clip, Err(LossError::InvalidConfig(_))));
}
