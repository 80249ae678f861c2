//! Integration tests for the text processor against the reference backend.
//!
//! Validates:
//! - `execute_input` precondition order and synchronous failures
//! - A scripted reply ends with `Finished` and clears the cache
//! - `TokenLimitReached` at the reserved context, cache cleared
//! - Client binding rules
//! - KvLock pinning and AutoLogitStore prefix reuse across turns
//! - halt_on_write, abandon (of a decode or a prefill), clear_response
//! - Backend failures end the sequence with `Failed` and keep the error
//! - `on_unregister` reaches a client the application had locked
//! - Deterministic sampling for a fixed seed

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use llama_runtime::{LogTelemetry, SequenceKind};
use llama_serve::{
    CachingMode, Client, ContextLine, DecodeBehavior, FinishState, ProcessorConfig,
    ProcessorError, ProcessorStatus, SamplerDescription, SamplerKind, TextProcessor, TokenId,
};

fn prompt(processor: &TextProcessor, len: usize) -> Vec<TokenId> {
    let tokens = processor.tokenize(&"a".repeat(len)).unwrap();
    assert_eq!(tokens.len(), len);
    tokens
}

fn bound(processor: &TextProcessor) -> Client<Transcript> {
    let client = Client::new(Transcript::default());
    processor.set_inference_client(&client).unwrap();
    client
}

// ===========================================================================
// Input checks
// ===========================================================================

#[test]
fn unregistered_processor_refuses_work() {
    let processor = TextProcessor::new();
    assert_eq!(
        processor.execute_input(vec![5, 6], false),
        Err(ProcessorError::Unregistered)
    );
    assert_eq!(
        processor.next(DecodeBehavior::default()),
        Err(ProcessorError::Unregistered)
    );
    assert_eq!(processor.tokenize("hi"), Err(ProcessorError::Unregistered));
    assert_eq!(processor.processor_status(), ProcessorStatus::Unregistered);
    assert_eq!(processor.destroy(), Ok(()));
    assert_eq!(processor.destroy_sync(), Ok(()));
}

#[test]
fn empty_input_leaves_processor_idle() {
    let fixture = load(&card("empty"), 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));

    assert_eq!(
        processor.execute_input(Vec::new(), false),
        Err(ProcessorError::InputEmpty)
    );
    assert_eq!(processor.processor_status(), ProcessorStatus::Idle);
    assert_eq!(processor.finish_state(), None);
    assert_eq!(
        processor.next(DecodeBehavior::default()),
        Err(ProcessorError::InputEmpty)
    );
}

#[test]
fn input_longer_than_context_is_rejected() {
    let fixture = load(&card("long"), 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(32));
    let tokens = prompt(&processor, 40);
    assert_eq!(
        processor.execute_input(tokens, false),
        Err(ProcessorError::InputExceedsTokenLimit { len: 40, limit: 32 })
    );
    assert_eq!(processor.processor_status(), ProcessorStatus::Idle);
}

#[test]
fn kv_lock_needs_matching_mode() {
    let fixture = load(&card("mode"), 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));
    let tokens = prompt(&processor, 4);
    assert_eq!(
        processor.execute_input(tokens, true),
        Err(ProcessorError::CachingModeMismatch)
    );
}

#[test]
fn halted_processor_refuses_input() {
    let fixture = load(&card("halted"), 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));
    let tokens = prompt(&processor, 4);

    processor.halt();
    assert!(!processor.is_running());
    assert!(!processor.is_available());
    assert_eq!(
        processor.execute_input(tokens.clone(), false),
        Err(ProcessorError::Halted)
    );

    processor.resume();
    processor.execute_input_sync(tokens, false).unwrap();
    assert_eq!(processor.cursor(), 4);
}

#[test]
fn second_input_while_processing_is_refused() {
    let mut slow = card("slow-prefill");
    slow.decode_delay_ms = 100;
    let fixture = load(&slow, 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));
    let tokens = prompt(&processor, 4);

    processor.execute_input(tokens.clone(), false).unwrap();
    assert_eq!(
        processor.execute_input(tokens.clone(), false),
        Err(ProcessorError::AlreadyProcessing)
    );
    assert_eq!(
        processor.next(DecodeBehavior::default()),
        Err(ProcessorError::AlreadyProcessing)
    );

    settle(&processor);
    assert_eq!(processor.processor_status(), ProcessorStatus::Idle);
    assert_eq!(processor.finish_state(), Some(FinishState::Continue));
}

// ===========================================================================
// Generation
// ===========================================================================

#[test]
fn scripted_reply_finishes_and_clears_cache() {
    let fixture = load(&scripted_card("chat", "ok"), 2048);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(128));
    let client = bound(&processor);

    let tokens = processor
        .tokenize_lines(&[ContextLine::user("hi")], true)
        .unwrap();
    let prompt_len = tokens.len();
    processor.execute_input_sync(tokens, false).unwrap();
    assert_eq!(processor.cursor(), prompt_len as u32);
    assert_eq!(client.lock().batches, vec![(prompt_len, false)]);

    processor
        .next_sync(DecodeBehavior::default().with_token_budget(8))
        .unwrap();

    let transcript = client.lock();
    assert_eq!(transcript.text, "ok");
    assert_eq!(transcript.tokens.len(), 3);
    assert_eq!(transcript.control_tokens.len(), 1);
    assert_eq!(transcript.finished, vec![(3, FinishState::Finished)]);
    drop(transcript);

    assert_eq!(processor.finish_state(), Some(FinishState::Finished));
    assert_eq!(processor.cursor(), 0);
    assert_eq!(
        processor.next(DecodeBehavior::default()),
        Err(ProcessorError::InputEmpty)
    );
}

#[test]
fn single_token_calls_step_through_the_reply() {
    let fixture = load(&scripted_card("stepper", "ok"), 2048);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(128));
    let client = bound(&processor);

    let tokens = processor
        .tokenize_lines(&[ContextLine::user("hi")], true)
        .unwrap();
    processor.execute_input_sync(tokens, false).unwrap();

    processor.next_sync(DecodeBehavior::default()).unwrap();
    assert_eq!(client.lock().text, "o");
    assert_eq!(processor.finish_state(), Some(FinishState::Continue));

    assert_eq!(run_to_end(&processor, 1), FinishState::Finished);
    assert_eq!(client.lock().text, "ok");
}

#[test]
fn reaching_the_reserved_context_stops_generation() {
    let fixture = load(&card("limit"), 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(32));
    let client = bound(&processor);

    let tokens = prompt(&processor, 10);
    processor.execute_input_sync(tokens, false).unwrap();
    processor
        .next_sync(DecodeBehavior::default().with_token_budget(64))
        .unwrap();

    assert_eq!(
        client.lock().finished,
        vec![(23, FinishState::TokenLimitReached)]
    );
    assert_eq!(processor.finish_state(), Some(FinishState::TokenLimitReached));
    assert_eq!(processor.cursor(), 0);
    // One clear before the prefill, one at the limit.
    assert_eq!(kv_clears(&fixture.log), 2);
    assert_eq!(processor.processor_status(), ProcessorStatus::Idle);
}

#[test]
fn failed_prefill_reports_the_backend_error() {
    let mut flaky = card("flaky-prefill");
    flaky.fail_decode_after = Some(0);
    let fixture = load(&flaky, 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));
    let client = bound(&processor);

    processor
        .execute_input_sync(prompt(&processor, 4), false)
        .unwrap();
    assert_eq!(processor.finish_state(), Some(FinishState::Failed));
    assert_eq!(processor.cursor(), 0);
    let error = processor.last_error().unwrap();
    assert!(error.contains("decode refused"), "{error}");

    let transcript = client.lock();
    assert!(transcript.batches.is_empty());
    assert_eq!(transcript.finished, vec![(0, FinishState::Failed)]);
    drop(transcript);
    assert_eq!(processor.processor_status(), ProcessorStatus::Idle);
    assert_eq!(
        processor.next(DecodeBehavior::default()),
        Err(ProcessorError::InputEmpty)
    );
}

#[test]
fn failed_decode_step_ends_the_sequence_once() {
    let mut flaky = card("flaky-step");
    flaky.fail_decode_after = Some(2);
    let fixture = load(&flaky, 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));
    let client = bound(&processor);

    processor
        .execute_input_sync(prompt(&processor, 5), false)
        .unwrap();
    assert_eq!(processor.last_error(), None);
    processor
        .next_sync(DecodeBehavior::default().with_token_budget(8))
        .unwrap();

    // The first step decodes; the second is refused.
    let transcript = client.lock();
    assert_eq!(transcript.tokens.len(), 1);
    assert_eq!(transcript.finished, vec![(1, FinishState::Failed)]);
    drop(transcript);
    assert_eq!(processor.finish_state(), Some(FinishState::Failed));
    assert!(processor.last_error().is_some());
    assert_eq!(processor.cursor(), 0);
    assert_eq!(fixture.log.live_contexts(), 1);
    assert_eq!(
        processor.next(DecodeBehavior::default()),
        Err(ProcessorError::InputEmpty)
    );
}

#[test]
fn update_delivers_what_the_worker_produced() {
    let fixture = load(&scripted_card("polled", "ok"), 2048);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(128));
    let client = bound(&processor);

    let tokens = processor
        .tokenize_lines(&[ContextLine::user("hi")], true)
        .unwrap();
    processor.execute_input(tokens, false).unwrap();
    settle(&processor);
    assert_eq!(client.lock().batches.len(), 1);

    processor
        .next(DecodeBehavior::default().with_token_budget(8))
        .unwrap();
    // Accepted and ignored while the first call is still pending.
    let _ = processor.next(DecodeBehavior::default());
    settle(&processor);
    assert_eq!(client.lock().text, "ok");
    assert_eq!(processor.finish_state(), Some(FinishState::Finished));
}

// ===========================================================================
// Client binding
// ===========================================================================

#[test]
fn client_binding_rules() {
    let fixture = load(&card("clients"), 1024);
    let a = text_processor(&fixture.model, ProcessorConfig::new(64));
    let b = text_processor(&fixture.model, ProcessorConfig::new(64));

    let client = bound(&a);
    assert_eq!(a.set_inference_client(&client), Ok(()));
    assert_eq!(client.lock().registered, 1);
    assert!(a.has_client());

    assert_eq!(
        b.set_inference_client(&client),
        Err(ProcessorError::BelongsToAnotherProcessor)
    );
    let other = Client::new(Transcript::default());
    assert_eq!(
        a.set_inference_client(&other),
        Err(ProcessorError::AlreadyProcessing)
    );

    a.release_inference_client().unwrap();
    assert_eq!(client.lock().unregistered, 1);
    assert!(!client.is_bound());
    assert_eq!(
        a.release_inference_client(),
        Err(ProcessorError::MissingClient)
    );

    b.set_inference_client(&client).unwrap();
    assert_eq!(client.lock().registered, 2);
}

#[test]
fn unregister_reaches_a_client_locked_during_destroy() {
    let fixture = load(&card("held"), 1024);
    let first = text_processor(&fixture.model, ProcessorConfig::new(64));
    let client = bound(&first);

    let transcript = client.lock();
    first.destroy_sync().unwrap();
    assert_eq!(transcript.unregistered, 0);
    drop(transcript);

    assert!(!client.is_bound());
    assert_eq!(client.lock().unregistered, 1);

    let second = text_processor(&fixture.model, ProcessorConfig::new(64));
    second.set_inference_client(&client).unwrap();
    let transcript = client.lock();
    assert_eq!(transcript.registered, 2);
    assert_eq!(transcript.unregistered, 1);
}

#[test]
fn destroy_releases_the_client_first() {
    let mut fixture = load(&card("teardown"), 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));
    let client = Client::new(Transcript::watching(fixture.log.clone()));
    processor.set_inference_client(&client).unwrap();

    processor.destroy().unwrap();
    assert_eq!(processor.destroy(), Err(ProcessorError::Destroying));
    assert_eq!(client.lock().unregistered, 1);
    processor.destroy_sync().unwrap();

    assert!(!processor.is_registered());
    assert!(!processor.has_client());
    fixture.model.update();
    assert_eq!(fixture.model.occupied_context(), 0);
    assert_eq!(fixture.log.live_contexts(), 0);
    // The weights belong to the model, not the processor.
    assert_eq!(weights_freed(&fixture.log), 0);
}

// ===========================================================================
// Caching
// ===========================================================================

#[test]
fn kv_lock_pins_the_system_prompt() {
    let fixture = load(&scripted_card("pinned", "ok"), 2048);
    let processor = text_processor(
        &fixture.model,
        ProcessorConfig::new(128).with_caching(CachingMode::KvLock),
    );
    let client = bound(&processor);

    let system = processor
        .tokenize_lines(&[ContextLine::system("be brief")], false)
        .unwrap();
    let pinned = system.len() as u32;
    processor.execute_input_sync(system, true).unwrap();
    assert_eq!(processor.cursor(), pinned);

    for turn in 1..=2 {
        let user = processor
            .tokenize_lines(&[ContextLine::user("hi")], true)
            .unwrap();
        let user_len = user.len();
        processor.execute_input_sync(user, false).unwrap();
        assert_eq!(processor.cursor(), pinned + user_len as u32);
        assert_eq!(client.lock().batches.last(), Some(&(user_len, false)));

        assert_eq!(run_to_end(&processor, 8), FinishState::Finished);
        assert_eq!(processor.cursor(), pinned);
        assert_eq!(client.lock().text, "ok".repeat(turn));
    }

    // The pinned prefix counts against the limit.
    let room = 128 - pinned as usize;
    let too_long = prompt(&processor, room + 1);
    assert_eq!(
        processor.execute_input(too_long, false),
        Err(ProcessorError::InputExceedsTokenLimit {
            len: room + 1,
            limit: 128
        })
    );
    let fits = prompt(&processor, room);
    processor.execute_input_sync(fits, false).unwrap();
    assert_eq!(processor.cursor(), 128);
}

#[test]
fn leaving_kv_lock_drops_the_pin() {
    let fixture = load(&card("unpinned"), 1024);
    let processor = text_processor(
        &fixture.model,
        ProcessorConfig::new(64).with_caching(CachingMode::KvLock),
    );
    let system = prompt(&processor, 8);
    processor.execute_input_sync(system, true).unwrap();

    processor.set_manual_caching(CachingMode::Disabled);
    assert_eq!(processor.caching_mode(), CachingMode::Disabled);
    let user = prompt(&processor, 3);
    processor.execute_input_sync(user, false).unwrap();
    assert_eq!(processor.cursor(), 3);
}

#[test]
fn auto_logit_store_reuses_the_common_prefix() {
    let fixture = load(&card("reuse"), 1024);
    let processor = text_processor(
        &fixture.model,
        ProcessorConfig::new(128).with_caching(CachingMode::AutoLogitStore),
    );
    let client = bound(&processor);

    let first = processor.tokenize("abcdefghijklmnopqrst").unwrap();
    assert_eq!(first.len(), 20);
    let mut second = first.clone();
    second.extend(processor.tokenize("uvwxy").unwrap());

    processor.execute_input_sync(first, false).unwrap();
    processor.execute_input_sync(second.clone(), false).unwrap();
    // Identical prompt: only the last token is replayed for its logits.
    processor.execute_input_sync(second, false).unwrap();

    let batches: Vec<usize> = client.lock().batches.iter().map(|b| b.0).collect();
    assert_eq!(batches, vec![20, 5, 1]);
    assert_eq!(processor.cursor(), 25);
    assert_eq!(kv_clears(&fixture.log), 1);
}

#[test]
fn clear_response_keeps_only_the_pinned_prefix() {
    let fixture = load(&card("cleared"), 1024);
    let processor = text_processor(
        &fixture.model,
        ProcessorConfig::new(64).with_caching(CachingMode::KvLock),
    );
    let system = prompt(&processor, 6);
    processor.execute_input_sync(system, true).unwrap();
    let user = prompt(&processor, 4);
    processor.execute_input_sync(user, false).unwrap();
    processor
        .next_sync(DecodeBehavior::default().with_token_budget(3))
        .unwrap();
    assert_eq!(processor.cursor(), 13);

    processor.clear_response().unwrap();
    settle(&processor);
    assert_eq!(processor.cursor(), 6);
    assert_eq!(processor.finish_state(), None);
    assert_eq!(
        processor.next(DecodeBehavior::default()),
        Err(ProcessorError::InputEmpty)
    );
}

// ===========================================================================
// Interruptions
// ===========================================================================

#[test]
fn halt_on_write_stops_after_one_token() {
    let fixture = load(&card("write-halt"), 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));
    let client = bound(&processor);
    processor
        .execute_input_sync(prompt(&processor, 5), false)
        .unwrap();

    let behavior = DecodeBehavior::default()
        .with_token_budget(10)
        .with_halt_on_write(true);
    processor.next_sync(behavior).unwrap();
    assert_eq!(client.lock().tokens.len(), 1);
    assert!(!processor.is_running());
    assert_eq!(processor.finish_state(), Some(FinishState::Continue));
    assert_eq!(
        processor.next(DecodeBehavior::default()),
        Err(ProcessorError::Halted)
    );

    processor.resume();
    processor
        .next_sync(DecodeBehavior::default().with_token_budget(2))
        .unwrap();
    assert_eq!(client.lock().tokens.len(), 3);
    assert_eq!(processor.cursor(), 8);
}

#[test]
fn abandon_replaces_a_running_decode() {
    let mut slow = card("abandoned");
    slow.decode_delay_ms = 20;
    let fixture = load(&slow, 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(256));
    let client = bound(&processor);
    processor
        .execute_input_sync(prompt(&processor, 4), false)
        .unwrap();

    processor
        .next(DecodeBehavior::default().with_token_budget(100))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    let replacement = prompt(&processor, 7);
    assert_eq!(
        processor.execute_input(replacement.clone(), false),
        Err(ProcessorError::AlreadyProcessing)
    );
    processor.execute_input_abandon(replacement, false).unwrap();
    settle(&processor);

    let transcript = client.lock();
    // Tokens of the abandoned decode never reach the client.
    assert!(transcript.tokens.is_empty());
    assert_eq!(transcript.batches, vec![(4, false), (7, false)]);
    drop(transcript);
    assert_eq!(processor.cursor(), 7);
    assert_eq!(processor.finish_state(), Some(FinishState::Continue));
}

#[test]
fn abandon_supersedes_a_prompt_in_prefill() {
    let mut slow = card("superseded");
    slow.decode_delay_ms = 200;
    let fixture = load(&slow, 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(128));
    let client = bound(&processor);
    let first = prompt(&processor, 6);
    let replacement = prompt(&processor, 9);

    processor.execute_input(first, false).unwrap();
    assert_eq!(
        processor.execute_input(replacement.clone(), false),
        Err(ProcessorError::AlreadyProcessing)
    );
    processor.execute_input_abandon(replacement, false).unwrap();
    settle(&processor);

    // Only the replacement is reported.
    assert_eq!(client.lock().batches, vec![(9, false)]);
    assert_eq!(processor.cursor(), 9);
    assert_eq!(processor.finish_state(), Some(FinishState::Continue));

    processor
        .next_sync(DecodeBehavior::default().with_token_budget(2))
        .unwrap();
    assert_eq!(client.lock().tokens.len(), 2);
    assert_eq!(processor.cursor(), 11);
}

// ===========================================================================
// Vocabulary and sampling
// ===========================================================================

#[test]
fn tokenize_checks_its_input() {
    let fixture = load(&scripted_card("vocab", "ok"), 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));

    assert_eq!(processor.tokenize(""), Err(ProcessorError::InputEmpty));
    assert_eq!(
        processor.tokenize_lines(&[], true),
        Err(ProcessorError::InputEmpty)
    );
    let plain = processor.tokenize("hi").unwrap();
    assert_eq!(plain.len(), 2);
    let end = processor.tokenize("<|im_end|>").unwrap();
    assert_eq!(end.len(), 1);
}

#[test]
fn token_descriptions() {
    let fixture = load(&scripted_card("described", "ok"), 1024);
    let processor = text_processor(&fixture.model, ProcessorConfig::new(64));

    let end = processor.tokenize("<|im_end|>").unwrap()[0];
    let description = processor.token_to_description(end).unwrap();
    assert_eq!(description.text, "<|im_end|>");
    assert!(description.is_control);
    assert!(description.is_special);

    let letter = processor.tokenize("a").unwrap()[0];
    let description = processor.token_to_description(letter).unwrap();
    assert_eq!(description.text, "a");
    assert!(!description.is_control);

    assert!(matches!(
        processor.token_to_description(1_000_000),
        Err(ProcessorError::TokenizationFailed(_))
    ));
}

#[test]
fn sampler_chain_is_reported_in_order() {
    let fixture = load(&card("chain"), 1024);
    let processor = text_processor(
        &fixture.model,
        ProcessorConfig::new(64)
            .with_sampler(SamplerDescription::TopK { k: 40 })
            .with_sampler(SamplerDescription::Temperature { temperature: 0.7 }),
    );
    assert!(processor.has_sampler(SamplerKind::TopK));
    assert!(!processor.has_sampler(SamplerKind::Repetition));
    assert_eq!(
        processor.available_samplers(),
        vec![SamplerKind::TopK, SamplerKind::Temperature]
    );
}

#[test]
fn seeded_chain_is_deterministic() {
    let fixture = load(&card("seeded"), 4096);
    let config = ProcessorConfig::new(256).with_samplers(vec![
        SamplerDescription::Seed { seed: 42 },
        SamplerDescription::TopK { k: 40 },
        SamplerDescription::TopP { p: 1.0 },
        SamplerDescription::MinP { p: 0.2 },
        SamplerDescription::Temperature { temperature: 0.1 },
    ]);

    let run = || {
        let processor = text_processor(&fixture.model, config.clone());
        let client = bound(&processor);
        processor
            .execute_input_sync(prompt(&processor, 12), false)
            .unwrap();
        processor
            .next_sync(DecodeBehavior::default().with_token_budget(16))
            .unwrap();
        let tokens = client.lock().tokens.clone();
        processor.destroy_sync().unwrap();
        tokens
    };

    let first = run();
    let second = run();
    assert_eq!(first.len(), 16);
    assert_eq!(first, second);
}

#[test]
fn telemetry_reports_each_sequence() {
    let fixture = load(&scripted_card("timed", "ok"), 2048);
    let telemetry = LogTelemetry::new();
    let processor = TextProcessor::new().with_telemetry(Arc::new(telemetry.clone()));
    fixture
        .model
        .register_text_processor(&processor, ProcessorConfig::new(128))
        .unwrap();
    processor.initialize_sync().unwrap();

    let tokens = processor
        .tokenize_lines(&[ContextLine::user("hi")], true)
        .unwrap();
    let prompt_len = tokens.len();
    processor.execute_input_sync(tokens, false).unwrap();
    assert_eq!(run_to_end(&processor, 8), FinishState::Finished);

    assert_eq!(telemetry.completed(), 1);
    let metrics = telemetry.last_metrics().unwrap();
    assert_eq!(metrics.processor, processor.id());
    assert_eq!(metrics.kind, SequenceKind::Text);
    assert_eq!(metrics.backend, "reference");
    assert_eq!(metrics.prompt_tokens, prompt_len);
    assert_eq!(metrics.generated_tokens, 3);
    assert_eq!(telemetry.generated_by(processor.id()), 3);
}
