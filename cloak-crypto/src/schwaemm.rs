use crate::sparkle::{sparkle256, STATE_WORDS, STEPS_BIG, STEPS_SLIM};
use crate::{Aead, CipherKey, Error, Nonce, TAG_SIZE};

const RATE_WORDS: usize = 4;
const RATE_BYTES: usize = 4 * RATE_WORDS;
const CAP_WORDS: usize = STATE_WORDS - RATE_WORDS;

// Domain-separation constants; `CAP_BRANS = 2` for a 128-bit capacity.
const CONST_A0: u32 = 4 << 24;
const CONST_A1: u32 = 5 << 24;
const CONST_M2: u32 = 6 << 24;
const CONST_M3: u32 = 7 << 24;

/// The Schwaemm128-128 AEAD: 128-bit key, nonce, and tag over the
/// Sparkle256 permutation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Schwaemm128128;

type State = [u32; STATE_WORDS];

fn load_words(bytes: &[u8; RATE_BYTES]) -> [u32; RATE_WORDS] {
    let mut words = [0u32; RATE_WORDS];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes"));
    }
    words
}

fn rate_to_bytes(state: &State) -> [u8; RATE_BYTES] {
    let mut bytes = [0u8; RATE_BYTES];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(&state[..RATE_WORDS]) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Pad a partial block: the data, then `0x80`, then zeros.
fn pad_block(data: &[u8]) -> [u8; RATE_BYTES] {
    debug_assert!(data.len() <= RATE_BYTES);
    let mut block = [0u8; RATE_BYTES];
    block[..data.len()].copy_from_slice(data);
    if data.len() < RATE_BYTES {
        block[data.len()] = 0x80;
    }
    block
}

/// The combined ρ₁/rate-whitening state update: Feistel-swap the rate
/// halves, inject the block, then whiten the rate with the capacity.
fn rho_whi(state: &mut State, block: &[u32; RATE_WORDS]) {
    for i in 0..RATE_WORDS / 2 {
        let tmp = state[i];
        state[i] = state[RATE_WORDS / 2 + i];
        state[RATE_WORDS / 2 + i] ^= tmp;
    }
    for i in 0..RATE_WORDS {
        state[i] ^= block[i];
    }
    for i in 0..RATE_WORDS {
        state[i] ^= state[RATE_WORDS + i];
    }
}

fn init(key: &CipherKey, nonce: &Nonce) -> State {
    let mut state = [0u32; STATE_WORDS];
    state[..RATE_WORDS].copy_from_slice(&load_words(nonce.as_ref()));
    state[RATE_WORDS..].copy_from_slice(&load_words(key.as_ref()));
    sparkle256(&mut state, STEPS_BIG);
    state
}

fn absorb_ad(state: &mut State, ad: &[u8]) {
    if ad.is_empty() {
        return;
    }
    let mut rest = ad;
    while rest.len() > RATE_BYTES {
        let (block, tail) = rest.split_at(RATE_BYTES);
        rho_whi(state, &load_words(block.try_into().expect("full block")));
        sparkle256(state, STEPS_SLIM);
        rest = tail;
    }
    state[STATE_WORDS - 1] ^= if rest.len() < RATE_BYTES {
        CONST_A0
    } else {
        CONST_A1
    };
    rho_whi(state, &load_words(&pad_block(rest)));
    sparkle256(state, STEPS_BIG);
}

fn finalize(state: &State, key: &CipherKey) -> [u8; TAG_SIZE] {
    let key_words = load_words(key.as_ref());
    let mut tag = [0u8; TAG_SIZE];
    for i in 0..CAP_WORDS {
        let word = state[RATE_WORDS + i] ^ key_words[i];
        tag[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
    }
    tag
}

impl Aead for Schwaemm128128 {
    fn encrypt(&self, key: &CipherKey, nonce: &Nonce, ad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut state = init(key, nonce);
        absorb_ad(&mut state, ad);

        let mut out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
        if !plaintext.is_empty() {
            let mut rest = plaintext;
            while rest.len() > RATE_BYTES {
                let (block, tail) = rest.split_at(RATE_BYTES);
                let rate = rate_to_bytes(&state);
                out.extend(block.iter().zip(&rate).map(|(m, r)| m ^ r));
                rho_whi(&mut state, &load_words(block.try_into().expect("full block")));
                sparkle256(&mut state, STEPS_SLIM);
                rest = tail;
            }
            let rate = rate_to_bytes(&state);
            out.extend(rest.iter().zip(&rate).map(|(m, r)| m ^ r));
            state[STATE_WORDS - 1] ^= if rest.len() < RATE_BYTES {
                CONST_M2
            } else {
                CONST_M3
            };
            rho_whi(&mut state, &load_words(&pad_block(rest)));
            sparkle256(&mut state, STEPS_BIG);
        }

        out.extend(finalize(&state, key));
        out
    }

    fn decrypt(
        &self,
        key: &CipherKey,
        nonce: &Nonce,
        ad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let body_len = ciphertext
            .len()
            .checked_sub(TAG_SIZE)
            .ok_or(Error::TruncatedCiphertext)?;
        let (body, tag) = ciphertext.split_at(body_len);

        let mut state = init(key, nonce);
        absorb_ad(&mut state, ad);

        let mut out = Vec::with_capacity(body_len);
        if !body.is_empty() {
            let mut rest = body;
            while rest.len() > RATE_BYTES {
                let (block, tail) = rest.split_at(RATE_BYTES);
                let rate = rate_to_bytes(&state);
                let plain: Vec<u8> = block.iter().zip(&rate).map(|(c, r)| c ^ r).collect();
                out.extend_from_slice(&plain);
                rho_whi(
                    &mut state,
                    &load_words(plain.as_slice().try_into().expect("full block")),
                );
                sparkle256(&mut state, STEPS_SLIM);
                rest = tail;
            }
            let rate = rate_to_bytes(&state);
            let plain: Vec<u8> = rest.iter().zip(&rate).map(|(c, r)| c ^ r).collect();
            out.extend_from_slice(&plain);
            state[STATE_WORDS - 1] ^= if rest.len() < RATE_BYTES {
                CONST_M2
            } else {
                CONST_M3
            };
            rho_whi(&mut state, &load_words(&pad_block(&plain)));
            sparkle256(&mut state, STEPS_BIG);
        }

        let expected = finalize(&state, key);
        let diff = expected
            .iter()
            .zip(tag)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(Error::InvalidTag);
        }
        Ok(out)
    }
}
