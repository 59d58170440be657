use crate::core::signing::PageSigner;
use crate::error::Result;
use crate::utils::{current_timestamp, sha256_digest, Hash};
use serde::{Deserialize, Serialize};

/// Longest page text a valid record may carry, so a full block stays well
/// inside one network frame.
pub const MAX_PAGE_TEXT_LEN: usize = 256 * 1024;

/// Who signed a page: a display name plus the raw public key bytes the
/// signature verifier needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SignerIdentity {
    pub username: String,
    pub public_key: Vec<u8>,
}

/// One signed page of a document. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PageRecord {
    title: String,
    page_index: u32,
    text: String,
    content_hash: Hash,
    signature: Vec<u8>,
    signer: SignerIdentity,
    created_at: i64,
}

impl PageRecord {
    /// Hashes the page text into its chained content hash and signs it.
    pub fn new_signed(
        title: &str,
        page_index: u32,
        text: &str,
        signer: &dyn PageSigner,
    ) -> Result<PageRecord> {
        let content_hash = chained_content_hash(title, page_index, text);
        let signature = signer.sign(&content_hash)?;
        Ok(PageRecord {
            title: title.to_string(),
            page_index,
            text: text.to_string(),
            content_hash,
            signature,
            signer: signer.identity(),
            created_at: current_timestamp()?,
        })
    }

    /// Assembles a record that was signed elsewhere. Nothing is checked here;
    /// the validator decides whether the record is acceptable.
    pub fn from_parts(
        title: String,
        page_index: u32,
        text: String,
        content_hash: Hash,
        signature: Vec<u8>,
        signer: SignerIdentity,
        created_at: i64,
    ) -> PageRecord {
        PageRecord {
            title,
            page_index,
            text,
            content_hash,
            signature,
            signer,
            created_at,
        }
    }

    pub fn get_title(&self) -> &str {
        &self.title
    }

    pub fn get_page_index(&self) -> u32 {
        self.page_index
    }

    pub fn get_text(&self) -> &str {
        &self.text
    }

    pub fn get_content_hash(&self) -> Hash {
        self.content_hash
    }

    pub fn get_signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn get_signer(&self) -> &SignerIdentity {
        &self.signer
    }

    pub fn get_created_at(&self) -> i64 {
        self.created_at
    }

    /// The sentences the content hash was chained over.
    pub fn sentences(&self) -> Vec<String> {
        split_sentences(&self.text)
    }

    /// Identity of a record, used for pool deduplication, Merkle leaves and
    /// orphan detection on reorg. Every field goes into the preimage, each
    /// variable-length one behind its length, so a block header commits to
    /// the whole record.
    pub fn record_id(&self) -> Hash {
        let mut data = Vec::with_capacity(
            self.title.len()
                + self.text.len()
                + self.signature.len()
                + self.signer.username.len()
                + self.signer.public_key.len()
                + 72,
        );
        push_field(&mut data, self.title.as_bytes());
        data.extend(self.page_index.to_be_bytes());
        push_field(&mut data, self.text.as_bytes());
        data.extend(self.content_hash.as_bytes());
        push_field(&mut data, &self.signature);
        push_field(&mut data, self.signer.username.as_bytes());
        push_field(&mut data, &self.signer.public_key);
        data.extend(self.created_at.to_be_bytes());
        sha256_digest(&data)
    }

    /// `(title, page index)` identifies a page across the whole ledger.
    pub fn page_key(&self) -> (&str, u32) {
        (self.title.as_str(), self.page_index)
    }

    pub fn has_consistent_content_hash(&self) -> bool {
        chained_content_hash(&self.title, self.page_index, &self.text) == self.content_hash
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty() && !self.signer.username.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn with_text(mut self, text: &str) -> PageRecord {
        self.text = text.to_string();
        self
    }
}

fn push_field(data: &mut Vec<u8>, bytes: &[u8]) {
    data.extend((bytes.len() as u64).to_be_bytes());
    data.extend(bytes);
}

/// Splits page text into sentences after collapsing whitespace. A sentence
/// ends at `.`, `?` or `!` followed by whitespace or the end of the text.
pub fn split_sentences(text: &str) -> Vec<String> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = normalized.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '?' | '!') && chars.peek().map_or(true, |n| *n == ' ') {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Hash chain over a page: a base step binds the title and page index, then
/// every sentence folds its own digest into the running value, so changing
/// any sentence, or their order, changes the result.
pub fn chained_content_hash(title: &str, page_index: u32, text: &str) -> Hash {
    let base = sha256_digest(format!("{title}|{page_index}").as_bytes());
    let mut acc = chain_step(&base, None, 0);

    for (step, sentence) in split_sentences(text).iter().enumerate() {
        let content = sha256_digest(sentence.as_bytes());
        acc = chain_step(&content, Some(&acc), step as u64 + 1);
    }
    acc
}

fn chain_step(content: &Hash, previous: Option<&Hash>, step: u64) -> Hash {
    let mut data = Vec::with_capacity(80);
    data.extend(content.as_bytes());
    data.push(b'|');
    if let Some(previous) = previous {
        data.extend(previous.as_bytes());
    }
    data.push(b'|');
    data.extend(step.to_be_bytes());
    sha256_digest(&data)
}

/// One page as the external document-matching search sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageContent<'a> {
    pub title: &'a str,
    pub page_index: u32,
    pub text: &'a str,
}
