use crate::common::*;

/// Resizes a `[channels, height, width]` mask with nearest neighbor sampling.
pub fn resize_mask(mask: &Tensor, height: i64, width: i64) -> Result<Tensor> {
    let (_channels, in_h, in_w) = mask.size3()?;
    if (in_h, in_w) == (height, width) {
        return Ok(mask.shallow_clone());
    }

    let output = mask
        .unsqueeze(0)
        .upsample_nearest2d(&[height, width], None, None)
        .squeeze_dim(0);
    Ok(output)
}

/// Resizes a `[2, height, width]` flow field bilinearly.
///
/// Displacements are rescaled by the size ratio so that they stay in pixel units.
pub fn resize_flow(flow: &Tensor, height: i64, width: i64) -> Result<Tensor> {
    let (channels, in_h, in_w) = flow.size3()?;
    ensure!(
        channels == 2,
        "expect a flow field with 2 channels, but get {}",
        channels
    );
    if (in_h, in_w) == (height, width) {
        return Ok(flow.shallow_clone());
    }

    let scale = Tensor::of_slice(&[width as f32 / in_w as f32, height as f32 / in_h as f32])
        .to_device(flow.device())
        .view([2, 1, 1]);
    let output = flow
        .unsqueeze(0)
        .upsample_bilinear2d(&[height, width], false, None, None)
        .squeeze_dim(0)
        * scale;
    Ok(output)
}

/// Resizes a `[batch, channels, height, width]` tensor bilinearly to the spatial size of `like`.
pub fn resize_like(xs: &Tensor, like: &Tensor) -> Result<Tensor> {
    let (_, _, in_h, in_w) = xs.size4()?;
    let (_, _, height, width) = like.size4()?;
    if (in_h, in_w) == (height, width) {
        return Ok(xs.shallow_clone());
    }
    Ok(xs.upsample_bilinear2d(&[height, width], false, None, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resized_flow_is_rescaled() -> Result<()> {
        let flow = Tensor::ones(&[2, 4, 8], FLOAT_CPU);
        let resized = resize_flow(&flow, 8, 4)?;
        assert_eq!(resized.size(), vec![2, 8, 4]);

        let u = f64::from(resized.get(0).mean(Kind::Float));
        let v = f64::from(resized.get(1).mean(Kind::Float));
        assert!((u - 0.5).abs() < 1e-6);
        assert!((v - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn resized_mask_stays_binary() -> Result<()> {
        let mask = Tensor::of_slice(&[0f32, 1., 1., 0.]).view([1, 2, 2]);
        let resized = resize_mask(&mask, 4, 4)?;
        assert_eq!(resized.size(), vec![1, 4, 4]);
        assert_eq!(f64::from(resized.sum(Kind::Float)), 8.0);
        Ok(())
    }
}
