use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::io::Cursor;
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::ApiClient;

#[derive(Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// 16-bit mono PCM WAV
#[hotpath::measure]
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(value)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Speech-to-text through the provider's `audio/transcriptions` endpoint
#[derive(Clone)]
pub struct RemoteTranscriber {
    client: ApiClient,
    deployment: String,
    sample_rate: u32,
}

impl RemoteTranscriber {
    pub fn new(client: ApiClient, deployment: &str, sample_rate: u32) -> Self {
        Self {
            client,
            deployment: deployment.to_string(),
            sample_rate,
        }
    }

    pub async fn transcribe(&self, samples: &[f32]) -> Result<String> {
        let wav = encode_wav(samples, self.sample_rate)?;
        debug!(
            samples = samples.len(),
            bytes = wav.len(),
            "uploading utterance"
        );

        let part = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let mut form = Form::new()
            .part("file", part)
            .text("response_format", "json");
        if let Some(model) = self.client.model_field(&self.deployment) {
            form = form.text("model", model.to_string());
        }

        let response = self
            .client
            .post(&self.deployment, "audio/transcriptions")
            .multipart(form)
            .send()
            .await?;
        let body: TranscriptionResponse = ApiClient::error_for_status(response).await?.json().await?;
        Ok(body.text.trim().to_string())
    }
}
