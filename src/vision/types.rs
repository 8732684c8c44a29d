use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Immutable snapshot of the page as the agent saw it. Produced fresh each
/// loop iteration and discarded after validation; only its fingerprint
/// outlives the iteration.
#[derive(Debug, Clone)]
pub struct Observation {
    pub url: String,
    pub title: String,
    /// PNG-encoded viewport screenshot.
    pub screenshot: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// Rectangle in screenshot pixel coordinates, `x_min < x_max`, `y_min < y_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

/// A box covering at least this fraction of the viewport is considered
/// coarse: too imprecise for a single center click, candidate for region
/// exploration. Result cards on a 1280×720 viewport sit around 10%;
/// tight link boxes well under 1%.
pub const COARSE_AREA_FRACTION: f64 = 0.03;

impl BoundingBox {
    pub fn new(x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> Self {
        Self { x_min, y_min, x_max, y_max }
    }

    pub fn width(&self) -> u32 {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> u32 {
        self.y_max.saturating_sub(self.y_min)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn center(&self) -> (u32, u32) {
        (
            self.x_min + self.width() / 2,
            self.y_min + self.height() / 2,
        )
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x_min && x < self.x_max && y >= self.y_min && y < self.y_max
    }

    /// True when the box lies fully inside the viewport.
    pub fn within(&self, viewport: (u32, u32)) -> bool {
        self.x_min < self.x_max
            && self.y_min < self.y_max
            && self.x_max <= viewport.0
            && self.y_max <= viewport.1
    }

    pub fn clamp_to(&self, viewport: (u32, u32)) -> BoundingBox {
        BoundingBox {
            x_min: self.x_min.min(viewport.0),
            y_min: self.y_min.min(viewport.1),
            x_max: self.x_max.min(viewport.0),
            y_max: self.y_max.min(viewport.1),
        }
    }

    /// Half width, half height, anchored at the original top-left corner.
    pub fn top_left_quadrant(&self) -> BoundingBox {
        BoundingBox {
            x_min: self.x_min,
            y_min: self.y_min,
            x_max: self.x_min + (self.width() / 2).max(1),
            y_max: self.y_min + (self.height() / 2).max(1),
        }
    }

    /// Centers of an `n × n` cell grid over the box, in row-major order.
    /// Deterministic; no randomized sampling.
    pub fn grid_points(&self, n: u32) -> Vec<(u32, u32)> {
        let n = n.max(1);
        let w = self.width() as f64;
        let h = self.height() as f64;
        let mut points = Vec::with_capacity((n * n) as usize);
        for row in 0..n {
            for col in 0..n {
                let px = self.x_min as f64 + (col as f64 + 0.5) * w / n as f64;
                let py = self.y_min as f64 + (row as f64 + 0.5) * h / n as f64;
                points.push((px.round() as u32, py.round() as u32));
            }
        }
        points
    }

    pub fn is_coarse(&self, viewport: (u32, u32)) -> bool {
        let viewport_area = viewport.0 as u64 * viewport.1 as u64;
        if viewport_area == 0 {
            return false;
        }
        self.area() as f64 / viewport_area as f64 >= COARSE_AREA_FRACTION
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScrollDirection::Up => write!(f, "up"),
            ScrollDirection::Down => write!(f, "down"),
        }
    }
}

/// The closed vocabulary of actions the model may emit. Anything else is a
/// schema violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { bbox: BoundingBox },
    Type { bbox: BoundingBox, text: String },
    Scroll { direction: ScrollDirection, amount: u32 },
    Back,
    Done,
}

/// Latest-release fields read off the final screenshot. Fields are optional:
/// the model extracts what the release card actually shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReleaseRecord {
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid field `{field}`: {reason}")]
pub struct SchemaError {
    pub field: String,
    pub reason: String,
}

impl SchemaError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Reshape the loosely structured payloads vision models actually return
/// into the canonical form `validate_action` expects. Maps type aliases,
/// lifts `coords` to `bbox`, flattens the nested scroll object, and coerces
/// fractional scroll amounts to a sane pixel default.
fn normalize_payload(mut payload: Value) -> Value {
    if let Some(ty) = payload.get("type").and_then(Value::as_str) {
        let canonical = match ty.to_ascii_lowercase().as_str() {
            "bbox" | "box" | "click_type" | "click_and_type" | "click-and-type" => Some("click"),
            _ => None,
        };
        if let Some(canonical) = canonical {
            payload["type"] = Value::String(canonical.into());
        }
    }

    if payload.get("bbox").is_none() {
        if let Some(coords) = payload.get("coords").cloned() {
            payload["bbox"] = coords;
        }
    }

    // Scroll fields may arrive nested ({"scroll": {"direction", "amount"}})
    // or flat; flatten for validation.
    if let Some(Value::Object(nested)) = payload.get("scroll").cloned() {
        if payload.get("direction").is_none() {
            if let Some(direction) = nested.get("direction").cloned() {
                payload["direction"] = direction;
            }
        }
        if payload.get("amount").is_none() {
            if let Some(amount) = nested.get("amount").cloned() {
                payload["amount"] = amount;
            }
        }
    }
    if let Some(amount) = payload.get("amount").and_then(Value::as_f64) {
        if amount > 0.0 && amount < 1.0 {
            payload["amount"] = Value::from(400);
        }
    }

    payload
}

/// Validates a raw model response against the action vocabulary and the
/// observed viewport. Pure: same input, same verdict, no hidden state.
pub fn validate_action(raw: &Value, viewport: (u32, u32)) -> Result<Action, SchemaError> {
    let payload = normalize_payload(raw.clone());

    let ty = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::new("type", "missing or not a string"))?;

    match ty {
        "click" => Ok(Action::Click {
            bbox: parse_bbox(&payload, viewport)?,
        }),
        "type" => {
            let bbox = parse_bbox(&payload, viewport)?;
            let text = payload
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if text.is_empty() {
                return Err(SchemaError::new("text", "type action requires non-empty text"));
            }
            Ok(Action::Type {
                bbox,
                text: text.to_string(),
            })
        }
        "scroll" => {
            let direction = payload
                .get("direction")
                .and_then(Value::as_str)
                .ok_or_else(|| SchemaError::new("direction", "missing or not a string"))?;
            let direction = match direction.to_ascii_lowercase().as_str() {
                "up" => ScrollDirection::Up,
                "down" => ScrollDirection::Down,
                other => {
                    return Err(SchemaError::new(
                        "direction",
                        format!("expected up or down, got `{other}`"),
                    ))
                }
            };
            let amount = payload
                .get("amount")
                .and_then(Value::as_f64)
                .ok_or_else(|| SchemaError::new("amount", "missing or not a number"))?;
            if amount <= 0.0 {
                return Err(SchemaError::new("amount", "must be positive"));
            }
            Ok(Action::Scroll {
                direction,
                amount: amount.round() as u32,
            })
        }
        "back" => Ok(Action::Back),
        "done" => Ok(Action::Done),
        other => Err(SchemaError::new(
            "type",
            format!("unknown action type `{other}`"),
        )),
    }
}

fn parse_bbox(payload: &Value, viewport: (u32, u32)) -> Result<BoundingBox, SchemaError> {
    let arr = payload
        .get("bbox")
        .and_then(Value::as_array)
        .ok_or_else(|| SchemaError::new("bbox", "missing or not an array"))?;
    if arr.len() != 4 {
        return Err(SchemaError::new(
            "bbox",
            format!("expected 4 coordinates, got {}", arr.len()),
        ));
    }

    let mut coords = [0i64; 4];
    for (i, v) in arr.iter().enumerate() {
        let n = v
            .as_f64()
            .ok_or_else(|| SchemaError::new("bbox", format!("coordinate {i} is not a number")))?;
        coords[i] = n.round() as i64;
    }
    let [x_min, y_min, x_max, y_max] = coords;

    if x_min < 0 || y_min < 0 {
        return Err(SchemaError::new("bbox", "coordinates must be non-negative"));
    }
    if x_min >= x_max || y_min >= y_max {
        return Err(SchemaError::new("bbox", "degenerate box (min must be below max)"));
    }
    if x_max > viewport.0 as i64 || y_max > viewport.1 as i64 {
        return Err(SchemaError::new(
            "bbox",
            format!(
                "box ({x_min},{y_min})-({x_max},{y_max}) exceeds viewport {}x{}",
                viewport.0, viewport.1
            ),
        ));
    }

    Ok(BoundingBox {
        x_min: x_min as u32,
        y_min: y_min as u32,
        x_max: x_max as u32,
        y_max: y_max as u32,
    })
}
