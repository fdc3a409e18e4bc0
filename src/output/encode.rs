// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/encode.rs - JPEG 编码
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::{ImageResult, RgbImage, codecs::jpeg::JpegEncoder};

pub const STREAM_JPEG_QUALITY: u8 = 80;
pub const SNAPSHOT_JPEG_QUALITY: u8 = 90;

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
  let mut buf = Vec::with_capacity(image.len() / 8);
  let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
  encoder.encode_image(image)?;
  Ok(buf)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn produces_jpeg_markers() {
    let image = RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10]));
    let jpeg = encode_jpeg(&image, STREAM_JPEG_QUALITY).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (16, 8));
  }
}
