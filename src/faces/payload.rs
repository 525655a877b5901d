//! Wire types pushed to subscribers once per processed frame.

use serde::Serialize;

/// A face found in one frame. `id` is the face's position in the frame and
/// says nothing about the same person in other frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedFace {
    pub id: String,
    pub name: String,
    pub confidence: f32,
    /// `[x, y, width, height]` in pixels
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStatus {
    pub is_detecting: bool,
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FramePayload {
    pub status: DetectionStatus,
    pub faces: Vec<DetectedFace>,
}

impl FramePayload {
    pub fn new(faces: Vec<DetectedFace>, last_updated: i64) -> Self {
        Self {
            status: DetectionStatus {
                is_detecting: true,
                last_updated,
            },
            faces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_wire_shape() {
        let payload = FramePayload::new(
            vec![DetectedFace {
                id: "0".to_string(),
                name: "alice".to_string(),
                confidence: 0.5,
                bbox: [10, 20, 30, 40],
                timestamp: 1_700_000_000_000,
            }],
            1_700_000_000_123,
        );

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({
                "status": {"isDetecting": true, "lastUpdated": 1_700_000_000_123i64},
                "faces": [{
                    "id": "0",
                    "name": "alice",
                    "confidence": 0.5,
                    "box": [10, 20, 30, 40],
                    "timestamp": 1_700_000_000_000i64
                }]
            })
        );
    }
}
