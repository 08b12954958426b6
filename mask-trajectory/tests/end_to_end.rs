use anyhow::Result;
use mask_trajectory::model::{MaskTrajectoryInit, Mode};
use tch::{kind::FLOAT_CPU, Device, Tensor};

#[test]
fn unet_inference_survives_weight_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let weights_file = dir.path().join("mask_trajectory.ot");

    let mut model = MaskTrajectoryInit::new(Mode::Inference).build(Device::Cpu)?;
    let flow = Tensor::randn(&[2, 256, 256], FLOAT_CPU);
    let prev_mask = Tensor::rand(&[1, 256, 256], FLOAT_CPU)
        .ge(0.5)
        .to_kind(tch::Kind::Float);

    let expect = model.infer(&flow.unsqueeze(0), &prev_mask.unsqueeze(0))?;
    assert_eq!(expect.size(), vec![1, 1, 256, 256]);
    assert!(bool::from(expect.ge(0.0).logical_and(&expect.le(1.0)).all()));

    let encoder_channels: Vec<_> = model
        .encoder_outputs()
        .iter()
        .map(|output| output.size()[1])
        .collect();
    assert_eq!(encoder_channels, vec![64, 128, 256, 512, 1024]);
    let decoder_channels: Vec<_> = model
        .decoder_outputs()
        .iter()
        .map(|output| output.size()[1])
        .collect();
    assert_eq!(decoder_channels, vec![512, 256, 128, 64]);

    model.save_weights(&weights_file)?;

    for by_name in [false, true] {
        let mut fresh = MaskTrajectoryInit::new(Mode::Inference).build(Device::Cpu)?;
        let before = fresh.infer(&flow.unsqueeze(0), &prev_mask.unsqueeze(0))?;
        assert!(!bool::from(before.eq_tensor(&expect).all()));

        fresh.load_weights(&weights_file, by_name)?;
        let found = fresh.infer(&flow.unsqueeze(0), &prev_mask.unsqueeze(0))?;
        let max_diff = f64::from((found - &expect).abs().max());
        assert!(max_diff < 1e-6, "outputs differ by {}", max_diff);
    }

    Ok(())
}
