//! Screen Capture Pipeline: capture, orientation fix-up, optional crop, reply.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use crate::api::error::CommandError;
use crate::engine::{CaptureRequest, Lookup, Rect};
use crate::session::Session;

/// Clockwise rotation applied to a captured image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Cw90,
    Cw180,
    Ccw90,
}

/// Rotation that puts an image captured at `orientation` upright. `None`
/// for upright or unknown orientations.
pub fn rotation_for(orientation: u8) -> Option<Rotation> {
    match orientation {
        2 => Some(Rotation::Cw180),
        3 => Some(Rotation::Ccw90),
        4 => Some(Rotation::Cw90),
        _ => None,
    }
}

/// Keep ASCII letters and digits only.
pub fn sanitize(name: &str) -> String {
    name.chars().filter(char::is_ascii_alphanumeric).collect()
}

pub fn rotate_file(path: &Path, rotation: Rotation) -> Result<(), image::ImageError> {
    let img = image::open(path)?;
    let rotated = match rotation {
        Rotation::Cw90 => img.rotate90(),
        Rotation::Cw180 => img.rotate180(),
        Rotation::Ccw90 => img.rotate270(),
    };
    rotated.save(path)
}

pub fn crop_file(path: &Path, rect: &Rect) -> Result<(), image::ImageError> {
    let img = image::open(path)?;
    let px = |v: f64| v.max(0.0).round() as u32;
    let cropped = img.crop_imm(
        px(rect.origin.x),
        px(rect.origin.y),
        px(rect.size.width),
        px(rect.size.height),
    );
    cropped.save(path)
}

async fn blocking<F>(f: F) -> Result<(), CommandError>
where
    F: FnOnce() -> Result<(), image::ImageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(CommandError::execution)?
        .map_err(CommandError::execution)
}

fn destination(session: &Session) -> (String, PathBuf) {
    let config = session.engine().config();
    let filename = format!("Screen-{}", sanitize(&session.engine().label()));
    let temp = config
        .get_str("temp")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let path = temp.join(format!("{filename}.png"));
    (filename, path)
}

/// `get latest screen`.
pub async fn capture(session: &Session) -> Result<Value, CommandError> {
    let engine = session.engine();
    let framework = engine.framework();
    let (filename, destination) = destination(session);

    let delay = engine
        .config()
        .get("timeToWaitForScreenShot")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let request = CaptureRequest {
        filename,
        destination: destination.clone(),
    };
    let capture = framework.capture_screen(&request).await?;
    let orientation = framework.orientation().await.unwrap_or(1);
    let status = framework.status().await;
    let backend = status.name.to_lowercase();

    if backend == "instruments" {
        if let Some(rotation) = rotation_for(orientation) {
            tracing::debug!(orientation, ?rotation, "rotating capture");
            let path = destination.clone();
            blocking(move || rotate_file(&path, rotation)).await?;
            return encode(session, &destination, None).await;
        }
    }

    if backend == "selenium" && status.device.eq_ignore_ascii_case("internet explorer") {
        if !session.is_alive() {
            return encode(session, &destination, capture.base64).await;
        }
        if let Some(snapshot) = session.registry().tree() {
            let root = engine.config().get_str("sodaRootId").unwrap_or_default();
            let rect = snapshot
                .tree
                .find(Lookup::Id, &root)
                .await
                .ok()
                .and_then(|found| found.into_iter().next())
                .and_then(|el| el.rect);
            if let Some(rect) = rect {
                let path = destination.clone();
                match blocking(move || crop_file(&path, &rect)).await {
                    Ok(()) => return encode(session, &destination, None).await,
                    Err(e) => tracing::warn!(error = %e, "crop failed, sending full capture"),
                }
            }
        }
    }

    encode(session, &destination, capture.base64).await
}

async fn encode(
    session: &Session,
    path: &Path,
    base64: Option<String>,
) -> Result<Value, CommandError> {
    let base64 = match base64 {
        Some(b) if !b.is_empty() => b,
        _ => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| CommandError::execution(format!("{}: {e}", path.display())))?;
            STANDARD.encode(bytes)
        }
    };
    Ok(json!({
        "path": path.to_string_lossy(),
        "number": session.next_image_number(),
        "base64": base64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Point, Size};
    use image::{GenericImageView, Rgba, RgbaImage};

    #[test]
    fn orientation_table() {
        assert_eq!(rotation_for(1), None);
        assert_eq!(rotation_for(2), Some(Rotation::Cw180));
        assert_eq!(rotation_for(3), Some(Rotation::Ccw90));
        assert_eq!(rotation_for(4), Some(Rotation::Cw90));
        assert_eq!(rotation_for(5), None);
        assert_eq!(rotation_for(0), None);
    }

    #[test]
    fn sanitize_strips_punctuation() {
        assert_eq!(sanitize("Engine-12"), "Engine12");
        assert_eq!(sanitize("a b/c.d"), "abcd");
    }

    fn write_png(path: &Path, w: u32, h: u32) {
        let mut img = RgbaImage::new(w, h);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        img.save(path).unwrap();
    }

    #[test]
    fn rotate_quarter_turn_swaps_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        write_png(&path, 4, 2);

        rotate_file(&path, Rotation::Ccw90).unwrap();
        assert_eq!(image::open(&path).unwrap().dimensions(), (2, 4));

        rotate_file(&path, Rotation::Cw180).unwrap();
        assert_eq!(image::open(&path).unwrap().dimensions(), (2, 4));
    }

    #[test]
    fn crop_to_rect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        write_png(&path, 10, 10);
        let rect = Rect {
            origin: Point { x: 2.0, y: 3.0 },
            size: Size {
                width: 4.0,
                height: 5.0,
            },
        };
        crop_file(&path, &rect).unwrap();
        assert_eq!(image::open(&path).unwrap().dimensions(), (4, 5));
    }

    #[test]
    fn rotating_a_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(rotate_file(&dir.path().join("none.png"), Rotation::Cw90).is_err());
    }
}
