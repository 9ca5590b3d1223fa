use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use llmwire::config::{HttpConfig, ProviderConfig};
use llmwire::protocol::canonical::{
    ContentBlock, GenerateOptions, Message, ProviderKind, ToolDefinition,
};
use llmwire::provider::Provider;
use llmwire::stream::{translator_for, ResponseAccumulator, SseDecoder};
use llmwire::transport::{HttpTransport, RetryPolicy};

const TEXT_DELTAS: usize = 200;

fn text_stream(kind: ProviderKind) -> String {
    let mut wire = String::new();
    let piece = "The quick brown fox jumps over the lazy dog. ";
    match kind {
        ProviderKind::Anthropic => {
            wire += "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude\",\"usage\":{\"input_tokens\":10}}}\n\n";
            wire += "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n";
            for _ in 0..TEXT_DELTAS {
                let delta = json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": piece}});
                wire += &format!("event: content_block_delta\ndata: {delta}\n\n");
            }
            wire += "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n";
            wire += "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":900}}\n\n";
            wire += "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n";
        }
        ProviderKind::OpenAi => {
            for _ in 0..TEXT_DELTAS {
                let chunk = json!({"id": "chatcmpl-1", "model": "gpt-4o", "choices": [{"index": 0, "delta": {"content": piece}, "finish_reason": null}]});
                wire += &format!("data: {chunk}\n\n");
            }
            wire += "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n";
            wire += "data: [DONE]\n\n";
        }
        ProviderKind::OpenAiResponses => {
            wire += "event: response.created\ndata: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_1\",\"model\":\"gpt-4.1\",\"output\":[]}}\n\n";
            wire += "event: response.content_part.added\ndata: {\"type\":\"response.content_part.added\",\"item_id\":\"msg_1\",\"output_index\":0,\"content_index\":0,\"part\":{\"type\":\"output_text\",\"text\":\"\"}}\n\n";
            for _ in 0..TEXT_DELTAS {
                let delta = json!({"type": "response.output_text.delta", "item_id": "msg_1", "output_index": 0, "content_index": 0, "delta": piece});
                wire += &format!("event: response.output_text.delta\ndata: {delta}\n\n");
            }
            wire += "event: response.content_part.done\ndata: {\"type\":\"response.content_part.done\",\"item_id\":\"msg_1\",\"output_index\":0,\"content_index\":0}\n\n";
            wire += "event: response.completed\ndata: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\",\"model\":\"gpt-4.1\",\"status\":\"completed\",\"output\":[]}}\n\n";
        }
        ProviderKind::Gemini => {
            for i in 0..TEXT_DELTAS {
                let mut candidate = json!({"content": {"role": "model", "parts": [{"text": piece}]}, "index": 0});
                if i + 1 == TEXT_DELTAS {
                    candidate["finishReason"] = json!("STOP");
                }
                let chunk = json!({"candidates": [candidate], "responseId": "r1", "modelVersion": "gemini-2.5-flash"});
                wire += &format!("data: {chunk}\r\n\r\n");
            }
        }
    }
    wire
}

fn translate_all(kind: ProviderKind, wire: &[u8], chunk_size: usize) -> usize {
    let mut decoder = SseDecoder::new();
    let mut translator = translator_for(kind);
    let mut acc = ResponseAccumulator::new();
    let mut frames = Vec::new();
    let mut events = Vec::new();
    for chunk in wire.chunks(chunk_size) {
        decoder.feed_bytes(chunk, &mut frames);
        for frame in frames.drain(..) {
            if translator.handle_frame(&frame, &mut events).is_err() {
                return 0;
            }
        }
        for event in events.drain(..) {
            let _ = acc.add_event(&event);
        }
    }
    acc.into_response().content.len()
}

fn bench_stream_translate(c: &mut Criterion) {
    let providers = [
        ("anthropic", ProviderKind::Anthropic),
        ("openai", ProviderKind::OpenAi),
        ("responses", ProviderKind::OpenAiResponses),
        ("gemini", ProviderKind::Gemini),
    ];
    let mut group = c.benchmark_group("stream_translate");
    for (name, kind) in providers {
        let wire = text_stream(kind);
        group.throughput(Throughput::Bytes(wire.len() as u64));
        // typical TCP read size, then a pathological byte-at-a-time feed
        for chunk_size in [1460_usize, 7] {
            group.bench_function(format!("{name}_chunk_{chunk_size}"), |b| {
                b.iter(|| black_box(translate_all(kind, black_box(wire.as_bytes()), chunk_size)));
            });
        }
    }
    group.finish();
}

fn conversation() -> (Vec<Message>, GenerateOptions) {
    let mut messages = Vec::with_capacity(41);
    for turn in 0..20 {
        messages.push(Message::user(format!("Question {turn}: what is the weather in Oslo?")));
        messages.push(Message::assistant(vec![ContentBlock::text(
            "It is cold and clear with light wind from the north.",
        )]));
    }
    messages.push(Message::user("And tomorrow?"));
    let options = GenerateOptions {
        system_prompt: Some("You are a weather assistant.".to_string()),
        tools: vec![ToolDefinition {
            name: "weather".to_string(),
            description: Some("Look up a forecast".to_string()),
            parameters: json!({"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}),
        }],
        ..GenerateOptions::default()
    };
    (messages, options)
}

fn bench_encode_request(c: &mut Criterion) {
    let (messages, options) = conversation();
    let transport = HttpTransport::new(&HttpConfig::default()).expect("transport");
    for kind in [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::OpenAiResponses,
        ProviderKind::Gemini,
    ] {
        let config = ProviderConfig {
            name: kind.as_str().to_string(),
            kind,
            base_url: None,
            api_key: Some("bench".to_string()),
            api_key_env: None,
            model: "bench-model".to_string(),
            max_tokens: Some(1024),
            api_version: None,
            headers: Vec::new(),
            retry: None,
        };
        let provider = Provider::from_config(&config, RetryPolicy::none(), transport.clone())
            .expect("provider");
        c.bench_function(&format!("encode_request_{kind}"), |b| {
            b.iter(|| black_box(provider.encode_request(black_box(&messages), &options, true)));
        });
    }
}

criterion_group!(benches, bench_stream_translate, bench_encode_request);
criterion_main!(benches);
