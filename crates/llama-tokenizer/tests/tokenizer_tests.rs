//! Integration tests for llama-tokenizer.
//!
//! Validates:
//! - Bit-perfect tokenization roundtrip (detokenize(tokenize(x)) == x)
//! - Unicode handling across streaming token boundaries
//! - Chat-template delimiters tokenize to single control tokens
//! - Thread safety (concurrent encode/decode)
//! - Trait object usage (dyn Tokenizer)

use llama_tokenizer::*;
use std::sync::Arc;

// ===========================================================================
// Bit-Perfect Roundtrip
// ===========================================================================

#[test]
fn roundtrip_preserves_whitespace_exactly() {
    let tok = ByteTokenizer::new();
    let inputs = [" a", "a ", "a  b", "\t\n", "  leading", "trailing  ", ""];
    for input in &inputs {
        let encoded = tok.encode(input).unwrap();
        assert_eq!(&tok.decode(&encoded).unwrap(), input, "roundtrip failed for {:?}", input);
    }
}

#[test]
fn roundtrip_unicode() {
    let tok = ByteTokenizer::new();
    let inputs = ["bonjour le monde", "héllo wörld", "日本語テキスト", "emoji 🦙🚀"];
    for input in &inputs {
        let encoded = tok.encode(input).unwrap();
        assert_eq!(&tok.decode(&encoded).unwrap(), input);
    }
}

#[test]
fn roundtrip_with_control_tokens() {
    let template = ChatTemplate::for_architecture("qwen2").unwrap();
    let tok = ByteTokenizer::with_special_tokens(template.control_strings());
    let prompt = template.render(&[ContextLine::user("what is a llama?")], true);

    let encoded = tok.encode(&prompt).unwrap();
    assert_eq!(tok.decode(&encoded).unwrap(), prompt);
}

// ===========================================================================
// Control Tokens
// ===========================================================================

#[test]
fn template_delimiters_become_single_tokens() {
    let template = ChatTemplate::for_architecture("llama").unwrap();
    let tok = ByteTokenizer::with_special_tokens(template.control_strings());

    let encoded = tok.encode("<|eot_id|>").unwrap();
    assert_eq!(encoded.len(), 1);
    assert!(tok.is_control(encoded[0]));
}

#[test]
fn every_architecture_registers_its_delimiters() {
    for arch in [
        "qwen2", "phi3", "llama", "gemma", "gemma2", "command-r", "deepseek", "vicuna",
        "zephyr", "openchat", "monarch", "orion",
    ] {
        let template = ChatTemplate::for_architecture(arch).unwrap();
        let tok = ByteTokenizer::with_special_tokens(template.control_strings());
        for s in template.control_strings() {
            assert!(tok.special_id(&s).is_some(), "{}: {:?} not registered", arch, s);
        }
    }
}

// ===========================================================================
// Streaming Decode
// ===========================================================================

#[test]
fn streaming_matches_batch_decode() {
    let tok = ByteTokenizer::new();
    let input = "naïve café — ok";
    let encoded = tok.encode(input).unwrap();

    let mut state = DecodingState::new();
    let mut streamed = String::new();
    for &id in &encoded {
        streamed.push_str(&tok.decode_token(id, &mut state).unwrap());
    }
    assert_eq!(streamed, input);
    assert_eq!(state.buffer(), input);
    assert!(!state.has_pending());
}

#[test]
fn streaming_never_emits_partial_characters() {
    let tok = ByteTokenizer::new();
    let encoded = tok.encode("🦙").unwrap();
    assert_eq!(encoded.len(), 4);

    let mut state = DecodingState::new();
    for &id in &encoded[..3] {
        assert_eq!(tok.decode_token(id, &mut state).unwrap(), "");
    }
    assert_eq!(tok.decode_token(encoded[3], &mut state).unwrap(), "🦙");
}

#[test]
fn streaming_invalid_token_errors() {
    let tok = ByteTokenizer::new();
    let mut state = DecodingState::new();
    assert_eq!(
        tok.decode_token(100_000, &mut state).unwrap_err(),
        TokenizerError::InvalidToken(100_000)
    );
}

// ===========================================================================
// Thread Safety and Trait Objects
// ===========================================================================

#[test]
fn concurrent_encode_decode() {
    let tok: Arc<dyn Tokenizer> = Arc::new(ByteTokenizer::with_special_tokens(["<|end|>"]));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let tok = tok.clone();
            std::thread::spawn(move || {
                let text = format!("thread {} says hi<|end|>", i);
                let ids = tok.encode(&text).unwrap();
                assert_eq!(tok.decode(&ids).unwrap(), text);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn dyn_tokenizer_reports_vocab() {
    let tok: Box<dyn Tokenizer> = Box::new(ByteTokenizer::new());
    assert_eq!(tok.vocab_size(), 3 + 256);
}
