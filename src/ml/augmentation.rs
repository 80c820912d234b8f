//! 学習時のデータ拡張
//!
//! 回転・シフト・せん断・ズーム・左右反転をランダムに組み合わせたアフィン変換を
//! サンプルごとに適用します。画像外の参照は端のピクセルで埋めます（nearest）。
//! 検証・テスト用のデータには適用しません。

use std::sync::Mutex;

use image::{imageops, Rgb, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::model::config::AugmentationSettings;

/// 1枚分の変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    /// 回転角度（度）
    pub rotation: f32,
    /// 水平シフト（幅に対する割合）
    pub shift_x: f32,
    /// 垂直シフト（高さに対する割合）
    pub shift_y: f32,
    /// せん断角度（度）
    pub shear: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub flip_horizontal: bool,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            rotation: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            shear: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip_horizontal: false,
        }
    }

    /// 変換を適用
    ///
    /// 出力座標を画像中心基準で 回転・(シフト)・せん断・ズーム の合成行列に通し、
    /// 入力画像の参照位置を求めてバイリニア補間します。
    pub fn apply(&self, img: &RgbImage) -> RgbImage {
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return img.clone();
        }

        let cx = (width as f32 - 1.0) / 2.0;
        let cy = (height as f32 - 1.0) / 2.0;

        let (sin_r, cos_r) = self.rotation.to_radians().sin_cos();
        let (sin_s, cos_s) = self.shear.to_radians().sin_cos();

        // R · Shear · Zoom
        let a00 = cos_r * self.zoom_x;
        let a01 = -cos_r * sin_s * self.zoom_y - sin_r * cos_s * self.zoom_y;
        let a10 = sin_r * self.zoom_x;
        let a11 = -sin_r * sin_s * self.zoom_y + cos_r * cos_s * self.zoom_y;

        // R · t
        let tx = self.shift_x * width as f32;
        let ty = self.shift_y * height as f32;
        let bx = cos_r * tx - sin_r * ty;
        let by = sin_r * tx + cos_r * ty;

        let mut out = RgbImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let px = x as f32 - cx;
                let py = y as f32 - cy;
                let sx = a00 * px + a01 * py + bx + cx;
                let sy = a10 * px + a11 * py + by + cy;
                out.put_pixel(x, y, sample_bilinear(img, sx, sy));
            }
        }

        if self.flip_horizontal {
            imageops::flip_horizontal_in_place(&mut out);
        }
        out
    }
}

/// 端でクランプするバイリニア補間
fn sample_bilinear(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let max_x = (img.width() - 1) as f32;
    let max_y = (img.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x0 = x0 as u32;
    let y0 = y0 as u32;
    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut pixel = [0u8; 3];
    for (c, value) in pixel.iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *value = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(pixel)
}

/// ランダム拡張器
///
/// 乱数生成器をシードで初期化するため、ワーカー1つなら同じ順序で同じ変換列になります。
pub struct Augmenter {
    settings: AugmentationSettings,
    rng: Mutex<StdRng>,
}

impl Augmenter {
    pub fn new(settings: AugmentationSettings, seed: u64) -> Self {
        Self {
            settings,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn settings(&self) -> &AugmentationSettings {
        &self.settings
    }

    /// 変換パラメータを1組抽選
    pub fn sample(&self) -> AffineParams {
        if !self.settings.enabled {
            return AffineParams::identity();
        }

        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let s = &self.settings;

        let mut symmetric = |range: f32| {
            if range > 0.0 {
                rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };
        let rotation = symmetric(s.rotation_range);
        let shift_x = symmetric(s.width_shift_range);
        let shift_y = symmetric(s.height_shift_range);
        let shear = symmetric(s.shear_range);
        let zoom_x = 1.0 + symmetric(s.zoom_range);
        let zoom_y = 1.0 + symmetric(s.zoom_range);
        let flip_horizontal = s.horizontal_flip && rng.gen_bool(0.5);

        AffineParams {
            rotation,
            shift_x,
            shift_y,
            shear,
            zoom_x,
            zoom_y,
            flip_horizontal,
        }
    }

    /// ランダムな変換を1回適用
    pub fn augment(&self, img: &RgbImage) -> RgbImage {
        let params = self.sample();
        if params == AffineParams::identity() {
            return img.clone();
        }
        params.apply(img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 77]))
    }

    #[test]
    fn test_identity_keeps_pixels() {
        let img = gradient_image(12);
        assert_eq!(AffineParams::identity().apply(&img), img);
    }

    #[test]
    fn test_horizontal_flip() {
        let img = gradient_image(8);
        let params = AffineParams {
            flip_horizontal: true,
            ..AffineParams::identity()
        };
        let out = params.apply(&img);
        assert_eq!(out.get_pixel(0, 3), img.get_pixel(7, 3));
        assert_eq!(out.get_pixel(7, 5), img.get_pixel(0, 5));
    }

    #[test]
    fn test_large_shift_fills_with_edge_pixels() {
        let img = gradient_image(10);
        let params = AffineParams {
            shift_x: 2.0,
            ..AffineParams::identity()
        };
        let out = params.apply(&img);
        for y in 0..10 {
            for x in 0..10 {
                assert_eq!(out.get_pixel(x, y), img.get_pixel(9, y));
            }
        }
    }

    #[test]
    fn test_sampled_params_stay_in_range() {
        let augmenter = Augmenter::new(AugmentationSettings::default(), 42);
        for _ in 0..200 {
            let p = augmenter.sample();
            assert!(p.rotation.abs() <= 20.0);
            assert!(p.shift_x.abs() <= 0.2 && p.shift_y.abs() <= 0.2);
            assert!(p.shear.abs() <= 0.2);
            assert!((0.8..=1.2).contains(&p.zoom_x));
            assert!((0.8..=1.2).contains(&p.zoom_y));
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let a = Augmenter::new(AugmentationSettings::default(), 7);
        let b = Augmenter::new(AugmentationSettings::default(), 7);
        for _ in 0..10 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    #[test]
    fn test_disabled_returns_original() {
        let settings = AugmentationSettings {
            enabled: false,
            ..AugmentationSettings::default()
        };
        let augmenter = Augmenter::new(settings, 1);
        let img = gradient_image(6);
        assert_eq!(augmenter.augment(&img), img);
    }

    #[test]
    fn test_augment_preserves_size() {
        let augmenter = Augmenter::new(AugmentationSettings::default(), 3);
        let img = gradient_image(16);
        let out = augmenter.augment(&img);
        assert_eq!(out.dimensions(), (16, 16));
    }
}
