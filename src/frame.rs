//! Framebuffer commit path: composition, row-oriented pixel reports, and
//! per-model coordinate fixups.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use chroma_transport::commands;
use chroma_transport::report::RazerReport;
use chroma_transport::types::Quirk;

use crate::color::{blend_pixel, composite_over, Rgba};
use crate::device::{ChromaDevice, DeviceError};
use crate::layer::Layer;

/// Maximum columns one frame-data report can carry.
pub const MAX_COLUMNS: usize = 24;
pub const DEFAULT_FRAME_ID: u8 = 0xFF;

/// RGB8 image rows produced by composition.
pub type Image = Vec<Vec<(u8, u8, u8)>>;

/// Owns layer creation and the per-tick commit for one device.
///
/// A report object is cached after first use and reset between rows, so a
/// streaming animation does not rebuild headers every frame.
pub struct Frame {
    device: Weak<ChromaDevice>,
    width: usize,
    height: usize,
    report: AsyncMutex<Option<RazerReport>>,
}

impl Frame {
    pub fn new(device: Weak<ChromaDevice>, width: usize, height: usize) -> Self {
        Self {
            device,
            width,
            height,
            report: AsyncMutex::new(None),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// A zeroed layer matching the lighting matrix.
    pub fn create_layer(&self) -> Layer {
        Layer::new(self.width, self.height)
    }

    /// Render a stack of layers into an RGB image.
    ///
    /// Layers blend in list order (which the animation loop keeps sorted
    /// by zindex) using each layer's blend mode and opacity, then the
    /// result is alpha-composited against the base layer's background
    /// color (black when unset). Background colors on non-base layers are
    /// ignored. Pure function; returns None for empty input.
    pub fn compose(layers: &[&Layer]) -> Option<Image> {
        let base = *layers.first()?;
        let background = base.background_color.unwrap_or(Rgba::BLACK);
        let height = base.height();
        let width = base.width();

        let mut out: Vec<Vec<Rgba>> = (0..height).map(|r| base.row(r).to_vec()).collect();

        for layer in &layers[1..] {
            if layer.width() != width || layer.height() != height {
                continue;
            }
            for (r, row) in out.iter_mut().enumerate() {
                for (c, pixel) in row.iter_mut().enumerate() {
                    *pixel = blend_pixel(*pixel, layer.get(r, c), layer.blend_mode, layer.opacity);
                }
            }
        }

        Some(
            out.into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|p| composite_over(p, background).to_rgb8())
                        .collect()
                })
                .collect(),
        )
    }

    /// Compose and write to hardware; `show` additionally activates the
    /// custom-frame effect so the upload becomes visible.
    pub async fn commit(
        &self,
        layers: &[&Layer],
        frame_id: Option<u8>,
        show: bool,
    ) -> Result<(), DeviceError> {
        let Some(img) = Self::compose(layers) else {
            return Ok(());
        };

        self.set_frame_data(&img, frame_id.unwrap_or(DEFAULT_FRAME_ID))
            .await?;

        if show {
            let device = self.device()?;
            Box::pin(
                device
                    .fx_manager()
                    .activate("custom_frame", Default::default()),
            )
            .await;
        }
        Ok(())
    }

    /// Blank the hardware frame without activating anything.
    pub async fn reset(&self) -> Result<(), DeviceError> {
        let layer = self.create_layer();
        self.commit(&[&layer], None, false).await
    }

    fn device(&self) -> Result<std::sync::Arc<ChromaDevice>, DeviceError> {
        self.device
            .upgrade()
            .ok_or(DeviceError::Unsupported("device is gone"))
    }

    async fn set_frame_data(&self, img: &Image, frame_id: u8) -> Result<(), DeviceError> {
        if self.height == 1 {
            self.set_frame_data_single(img).await
        } else {
            self.set_frame_data_matrix(img, frame_id).await
        }
    }

    /// Single-row devices take one report with up to 24 pixels.
    async fn set_frame_data_single(&self, img: &Image) -> Result<(), DeviceError> {
        let device = self.device()?;
        let width = self.width.min(MAX_COLUMNS);

        let mut args = vec![0x00, width as u8];
        for &(r, g, b) in img[0].iter().take(width) {
            args.extend_from_slice(&[r, g, b]);
        }

        device
            .run_command_with(
                &commands::SET_FRAME_DATA_SINGLE,
                &args,
                Some(0x80),
                None,
                0,
            )
            .await?;
        Ok(())
    }

    /// Multi-row devices take one report per row; rows wider than
    /// [`MAX_COLUMNS`] are split into two half-row updates. The
    /// remaining-packets field tells the hardware when the batch ends.
    async fn set_frame_data_matrix(&self, img: &Image, frame_id: u8) -> Result<(), DeviceError> {
        let device = self.device()?;
        let _guard = device.device_open();

        let multi = self.width > MAX_COLUMNS;
        let width = if multi { self.width / 2 } else { self.width };

        let img = self.align_key_matrix(&device, img);

        let mut report_slot = self.report.lock().await;

        for (row, rowdata) in img.iter().enumerate().take(self.height) {
            let start_col = self.row_offset(&device, row);

            let mut remaining = (self.height - row - 1) as u16;
            if multi {
                remaining = remaining * 2 + 1;
            }

            let first: Vec<u8> = rowdata
                .iter()
                .take(width)
                .flat_map(|&(r, g, b)| [r, g, b])
                .collect();
            let end_col = start_col + (first.len() / 3) as u8 - 1;

            self.run_row(
                &device,
                &mut report_slot,
                remaining,
                &[frame_id, row as u8, start_col, end_col],
                &first,
            )
            .await?;

            if multi {
                tokio::time::sleep(Duration::from_millis(1)).await;

                let second: Vec<u8> = rowdata
                    .iter()
                    .skip(width)
                    .flat_map(|&(r, g, b)| [r, g, b])
                    .collect();
                let end_col = width as u8 + (second.len() / 3) as u8 - 1;

                self.run_row(
                    &device,
                    &mut report_slot,
                    remaining - 1,
                    &[frame_id, row as u8, width as u8, end_col],
                    &second,
                )
                .await?;
            }

            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        Ok(())
    }

    async fn run_row(
        &self,
        device: &std::sync::Arc<ChromaDevice>,
        report_slot: &mut Option<RazerReport>,
        remaining: u16,
        header: &[u8],
        pixels: &[u8],
    ) -> Result<(), DeviceError> {
        let report = report_slot.get_or_insert_with(|| {
            let tid = if device.has_quirk(Quirk::CustomFrame80) {
                0x80
            } else {
                0xFF
            };
            device.get_report(
                commands::SET_FRAME_DATA_MATRIX.command_class,
                commands::SET_FRAME_DATA_MATRIX.command_id,
                None,
                Some(tid),
            )
        });

        report.clear();
        report.args().put_slice(header).put_slice(pixels);
        report.set_remaining_packets(remaining);

        device.run_report(report, None).await?;
        Ok(())
    }

    /// Apply per-model inserts, deletes, and copies so the logical matrix
    /// lines up with the physical LED layout.
    fn align_key_matrix(&self, device: &std::sync::Arc<ChromaDevice>, img: &Image) -> Image {
        let Some(fixups) = &device.hardware().key_fixups else {
            return img.clone();
        };

        let mut out = img.clone();

        for &(row, col) in &fixups.insert {
            let (row, col) = (row as usize, col as usize);
            if row < out.len() && col <= out[row].len() {
                out[row].insert(col, (0, 0, 0));
            }
        }

        for &(row, col) in &fixups.delete {
            let (row, col) = (row as usize, col as usize);
            if row < out.len() && col < out[row].len() {
                out[row].remove(col);
            }
        }

        for &((src_row, src_col), (dst_row, dst_col)) in &fixups.copy {
            let src = out
                .get(src_row as usize)
                .and_then(|r| r.get(src_col as usize))
                .copied();
            if let Some(pixel) = src {
                if let Some(cell) = out
                    .get_mut(dst_row as usize)
                    .and_then(|r| r.get_mut(dst_col as usize))
                {
                    *cell = pixel;
                }
            }
        }

        if out != *img {
            debug!("Applied key matrix fixups");
        }
        out
    }

    fn row_offset(&self, device: &std::sync::Arc<ChromaDevice>, row: usize) -> u8 {
        device
            .hardware()
            .row_offsets
            .as_ref()
            .and_then(|offsets| offsets.get(row).copied())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::BlendMode;

    fn opaque_layer(width: usize, height: usize, color: Rgba) -> Layer {
        let mut layer = Layer::new(width, height);
        layer.fill(color);
        layer
    }

    #[test]
    fn test_compose_empty_is_none() {
        assert!(Frame::compose(&[]).is_none());
    }

    #[test]
    fn test_compose_identity_for_single_opaque_layer() {
        let mut layer = Layer::new(4, 2);
        for r in 0..2 {
            for c in 0..4 {
                layer.put(r, c, Rgba::from_rgb8((r * 4 + c) as u8 * 10, 100, 200));
            }
        }
        layer.blend_mode = BlendMode::Normal;
        layer.opacity = 1.0;

        let img = Frame::compose(&[&layer]).unwrap();
        for r in 0..2 {
            for c in 0..4 {
                assert_eq!(img[r][c], layer.get(r, c).to_rgb8());
            }
        }
    }

    #[test]
    fn test_compose_ignores_non_base_background() {
        let base = opaque_layer(3, 3, Rgba::from_rgb8(10, 20, 30));
        let mut top = Layer::new(3, 3);
        top.background_color = Some(Rgba::from_rgb8(255, 0, 0));

        let with_bg = Frame::compose(&[&base, &top]).unwrap();
        top.background_color = None;
        let without_bg = Frame::compose(&[&base, &top]).unwrap();
        assert_eq!(with_bg, without_bg);
    }

    #[test]
    fn test_compose_base_background_fills_transparency() {
        let mut base = Layer::new(2, 1);
        base.background_color = Some(Rgba::from_rgb8(0, 0, 255));
        let img = Frame::compose(&[&base]).unwrap();
        assert_eq!(img[0][0], (0, 0, 255));
    }

    #[test]
    fn test_compose_stacks_in_order() {
        let base = opaque_layer(2, 2, Rgba::from_rgb8(10, 10, 10));
        let top = opaque_layer(2, 2, Rgba::from_rgb8(200, 0, 0));
        let img = Frame::compose(&[&base, &top]).unwrap();
        assert_eq!(img[0][0], (200, 0, 0));
    }
}
