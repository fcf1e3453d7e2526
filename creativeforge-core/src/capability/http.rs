//! OpenAI-compatible chat-completions provider.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::extract::extract_json;
use super::{CapabilityError, GenerativeCapability, LayoutPrompt, RawDetection, VisionCapability};
use crate::model::Asset;
use crate::semantic::{JudgeRequest, SemanticJudgement};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelNames {
    pub vision: String,
    pub layout: String,
    pub judge: String,
}

impl Default for ModelNames {
    fn default() -> Self {
        Self {
            vision: "gemini-2.5-flash-lite".into(),
            layout: "gemma-3-27b-it".into(),
            judge: "gemma-3-27b-it".into(),
        }
    }
}

pub struct HttpCapability {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    models: ModelNames,
}

const DETECT_PROMPT: &str = r#"Analyze this product image. Return ONLY a JSON object:
{"product_type": "<brief description>", "objects": [{"label": "<name>", "confidence": 0.95, "bbox": [x1, y1, x2, y2]}]}
Detect all visible objects including products, packshots, people, bottles, glasses and logos."#;

const JUDGE_PROMPT: &str = "You check retail ad copy against what is visible in the product image. \
You receive normalized copy claims and normalized detected object labels with product categories. \
Decide whether the copy describes the detected product. Answer ONLY with JSON: \
{\"aligned\": true|false, \"explanation\": \"...\"}";

impl HttpCapability {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, models: ModelNames) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key,
            models,
        }
    }

    async fn chat(&self, model: &str, messages: Value) -> Result<String, CapabilityError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": 0.2,
        });
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(CapabilityError::Unavailable(format!("{model} returned {status}")));
        }
        if !status.is_success() {
            return Err(CapabilityError::Unavailable(format!("{model} rejected the request with {status}")));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| CapabilityError::Malformed(e.to_string()))?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CapabilityError::Malformed("response has no message content".into()))
    }
}

/// Prompt text for a layout request.
pub fn layout_instructions(prompt: &LayoutPrompt) -> String {
    let c = &prompt.content;
    let p = &prompt.palette;
    let labels = if prompt.detected_labels.is_empty() {
        "(none detected)".to_string()
    } else {
        prompt.detected_labels.join(", ")
    };
    let mut text = format!(
        "Design a retail media banner exactly {w}px x {h}px (ratio {ratio}).\n\
         Headline: {headline}\nSubheadline: {sub}\nDescription/tag: {desc}\n\
         Regular price: {price}\nOffer price: {offer}\n\
         Palette: primary {primary}, secondary {secondary}, accent {accent}, background {bg}\n\
         Logo supplied: {logo}. Background image supplied: {bgimg}.\nDetected objects: {labels}\n\n\
         Rules:\n\
         - Place the packshot large and central (~55% of the canvas).\n\
         - Price and offer appear ONLY inside one value tile (role \"price\"), bottom-right.\n\
         - Never put prices, percentages or currency in the headline or subheadline.\n\
         - All text at least 20px and WCAG AA contrast (4.5:1) against what is behind it.\n\
         - No element may completely cover another text, logo or value tile element.\n",
        w = prompt.canvas.width,
        h = prompt.canvas.height,
        ratio = prompt.ratio,
        headline = c.headline,
        sub = c.subheadline().unwrap_or("-"),
        desc = c.description().unwrap_or("-"),
        price = c.price().unwrap_or("-"),
        offer = c.offer().unwrap_or("-"),
        primary = p.primary,
        secondary = p.secondary,
        accent = p.accent,
        bg = p.background,
        logo = if prompt.has_logo { "yes, place it exactly once" } else { "no" },
        bgimg = if prompt.has_background_image { "yes" } else { "no" },
    );
    if prompt.ratio == crate::layout::Ratio::Vertical {
        text.push_str("- Keep the top 200px and bottom 250px free of text, logos and value tiles.\n");
    }
    if prompt.alcohol_detected {
        text.push_str("- Alcohol detected: include a Drinkaware lock-up (role \"drinkaware\") middle-left.\n");
    }
    text.push_str(
        "\nAnswer with a JSON object {\"background\": {\"color\": \"#RRGGBB\"}, \"elements\": [\
         {\"type\": \"text|image|logo|shape\", \"role\": \"headline|subheadline|description|tag|price|packshot|logo|drinkaware|decoration\", \
         \"x\": 0.0, \"y\": 0.0, \"width\": 0.0, \"height\": 0.0, \"text\": \"...\", \"color\": \"#RRGGBB\", \"fill\": \"#RRGGBB\", \"fontSize\": 0}]} \
         with geometry as fractions of the canvas, elements listed back to front.",
    );
    if prompt.strict {
        text.push_str(
            "\nYour previous answer could not be used. Output ONLY the JSON object, no prose, no code fences, \
             every coordinate between 0 and 1, x+width <= 1 and y+height <= 1.",
        );
    }
    text
}

#[async_trait]
impl VisionCapability for HttpCapability {
    fn name(&self) -> &str {
        "http"
    }

    async fn detect(&self, asset: &Asset) -> Result<RawDetection, CapabilityError> {
        let data = base64::engine::general_purpose::STANDARD.encode(&asset.bytes);
        let messages = json!([{
            "role": "user",
            "content": [
                { "type": "text", "text": DETECT_PROMPT },
                { "type": "image_url", "image_url": { "url": format!("data:{};base64,{}", asset.mime_type, data) } }
            ]
        }]);
        let answer = self.chat(&self.models.vision, messages).await?;
        let value = extract_json(&answer).ok_or_else(|| CapabilityError::Malformed("no JSON in detection".into()))?;
        serde_json::from_value(value).map_err(|e| CapabilityError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl GenerativeCapability for HttpCapability {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate_layout(&self, prompt: &LayoutPrompt) -> Result<String, CapabilityError> {
        let messages = json!([{ "role": "user", "content": layout_instructions(prompt) }]);
        self.chat(&self.models.layout, messages).await
    }

    async fn judge_semantic_match(&self, request: &JudgeRequest) -> Result<SemanticJudgement, CapabilityError> {
        let signals = serde_json::to_string(request).map_err(|e| CapabilityError::Malformed(e.to_string()))?;
        let messages = json!([
            { "role": "system", "content": JUDGE_PROMPT },
            { "role": "user", "content": signals }
        ]);
        let answer = self.chat(&self.models.judge, messages).await?;
        let value = extract_json(&answer).ok_or_else(|| CapabilityError::Malformed("no JSON in judgement".into()))?;
        serde_json::from_value(value).map_err(|e| CapabilityError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Ratio;
    use crate::model::ContentSpec;
    use crate::palette::ResolvedPalette;

    fn prompt(ratio: Ratio, strict: bool) -> LayoutPrompt {
        LayoutPrompt {
            ratio,
            canvas: ratio.canvas(),
            content: ContentSpec { headline: "Crunchy Crisps".into(), ..Default::default() },
            palette: ResolvedPalette::default(),
            detected_labels: vec![],
            has_logo: false,
            has_background_image: false,
            alcohol_detected: true,
            strict,
        }
    }

    #[test]
    fn test_instructions_mention_constraints() {
        let text = layout_instructions(&prompt(Ratio::Vertical, false));
        assert!(text.contains("1080px x 1920px"));
        assert!(text.contains("top 200px"));
        assert!(text.contains("Drinkaware"));
        assert!(!text.contains("previous answer"));
    }

    #[test]
    fn test_strict_instructions() {
        let text = layout_instructions(&prompt(Ratio::Square, true));
        assert!(text.contains("previous answer could not be used"));
        assert!(!text.contains("top 200px"));
    }
}
