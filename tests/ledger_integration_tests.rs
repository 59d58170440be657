//! Ledger integration tests
//!
//! Exercises the public chain API the way a node uses it: signed pages, mined
//! blocks, full-chain validation, fork choice and the chain file.

use page_ledger::core::{BlockHeader, ForkChoice, ForkDecision, PageContent, SignerIdentity};
use page_ledger::storage::{decode_chain, encode_chain};
use page_ledger::{
    genesis_block, Block, Chain, ChainStore, DifficultyPolicy, EcdsaP256Signer, EcdsaP256Verifier,
    FileChainStore, Hash, LedgerError, PageRecord, ProofOfWork, Validator,
};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

const DIFFICULTY: u32 = 8;

fn validator() -> Validator {
    Validator::new(Arc::new(EcdsaP256Verifier), DifficultyPolicy::Fixed(DIFFICULTY))
}

fn mine_on(previous: &Block, records: Vec<PageRecord>) -> Block {
    let template =
        Block::new_template(previous, records, DIFFICULTY, previous.get_timestamp() + 1_000)
            .unwrap();
    ProofOfWork::solve(template)
}

fn page(signer: &EcdsaP256Signer, title: &str, index: u32) -> PageRecord {
    let text = format!("This is page {index} of {title}. It has two sentences.");
    PageRecord::new_signed(title, index, &text, signer).unwrap()
}

fn signed_chain(signer: &EcdsaP256Signer, titles: &[&str]) -> Chain {
    let mut chain = Chain::new();
    for title in titles {
        let block = mine_on(chain.tip(), vec![page(signer, title, 0), page(signer, title, 1)]);
        chain.append(block).unwrap();
    }
    chain
}

fn replace(chain: &Chain, index: usize, block: Block) -> Chain {
    let mut blocks = chain.blocks().to_vec();
    blocks[index] = block;
    Chain::from_blocks(blocks).unwrap()
}

fn with_header(block: &Block, header: BlockHeader) -> Block {
    Block::from_parts(header, block.get_records().to_vec())
}

struct RecordParts {
    title: String,
    page_index: u32,
    text: String,
    content_hash: Hash,
    signature: Vec<u8>,
    signer: SignerIdentity,
    created_at: i64,
}

fn edit_first_record(block: &Block, edit: impl FnOnce(&mut RecordParts)) -> Block {
    let mut records = block.get_records().to_vec();
    let r = &records[0];
    let mut parts = RecordParts {
        title: r.get_title().to_string(),
        page_index: r.get_page_index(),
        text: r.get_text().to_string(),
        content_hash: r.get_content_hash(),
        signature: r.get_signature().to_vec(),
        signer: r.get_signer().clone(),
        created_at: r.get_created_at(),
    };
    edit(&mut parts);
    records[0] = PageRecord::from_parts(
        parts.title,
        parts.page_index,
        parts.text,
        parts.content_hash,
        parts.signature,
        parts.signer,
        parts.created_at,
    );
    Block::from_parts(block.get_header().clone(), records)
}

#[test]
fn test_mined_blocks_meet_their_target() {
    let signer = EcdsaP256Signer::generate("alice").unwrap();
    let chain = signed_chain(&signer, &["Charter", "Bylaws"]);

    for block in &chain.blocks()[1..] {
        assert!(ProofOfWork::validate(block));
        assert!(ProofOfWork::meets_target(&block.hash(), block.get_difficulty()));
        assert!(block.verify_records_root());
    }
    validator().validate_chain(&chain).unwrap();
}

#[test]
fn test_any_single_field_mutation_of_an_interior_block_fails() {
    let signer = EcdsaP256Signer::generate("alice").unwrap();
    let chain = signed_chain(&signer, &["One", "Two", "Three"]);
    let validator = validator();
    validator.validate_chain(&chain).unwrap();

    let target = chain.get(2).unwrap();
    let h = target.get_header();
    let (index, prev, ts, nonce, difficulty, root) = (
        h.get_index(),
        h.get_previous_hash(),
        h.get_timestamp(),
        h.get_nonce(),
        h.get_difficulty(),
        h.get_records_root(),
    );
    let rebuild = |(index, prev, ts, nonce, difficulty, root): (u64, Hash, i64, u64, u32, Hash)| {
        with_header(target, BlockHeader::new(index, prev, ts, nonce, difficulty, root))
    };
    let other_root = genesis_block().get_header().get_records_root();

    let mut mutations = vec![
        rebuild((index + 1, prev, ts, nonce, difficulty, root)),
        rebuild((index, genesis_block().hash(), ts, nonce, difficulty, root)),
        rebuild((index, prev, ts + 1, nonce, difficulty, root)),
        rebuild((index, prev, ts, nonce.wrapping_add(1), difficulty, root)),
        rebuild((index, prev, ts, nonce, difficulty + 1, root)),
        rebuild((index, prev, ts, nonce, difficulty, other_root)),
        Block::from_parts(h.clone(), vec![page(&signer, "Two", 0)]),
    ];

    // Same header, one field of the first record changed.
    mutations.push(edit_first_record(target, |p| p.title.push('!')));
    mutations.push(edit_first_record(target, |p| p.page_index += 7));
    mutations.push(edit_first_record(target, |p| p.text = "Rewritten.".to_string()));
    mutations.push(edit_first_record(target, |p| p.content_hash = other_root));
    mutations.push(edit_first_record(target, |p| p.signature[0] ^= 1));
    mutations.push(edit_first_record(target, |p| p.signer.username = "mallory".to_string()));
    mutations.push(edit_first_record(target, |p| p.signer.public_key.push(0)));
    mutations.push(edit_first_record(target, |p| p.created_at = 42));

    for (i, mutated) in mutations.into_iter().enumerate() {
        let broken = replace(&chain, 2, mutated);
        let err = validator.validate_chain(&broken).unwrap_err();
        assert!(err.index == 2 || err.index == 3, "mutation {i} failed at {err}");
    }
}

#[test]
fn test_record_signed_by_someone_else_is_rejected() {
    let alice = EcdsaP256Signer::generate("alice").unwrap();
    let mallory = EcdsaP256Signer::generate("mallory").unwrap();
    let honest = page(&alice, "Deed", 0);
    let forged = PageRecord::from_parts(
        honest.get_title().to_string(),
        honest.get_page_index(),
        honest.get_text().to_string(),
        honest.get_content_hash(),
        honest.get_signature().to_vec(),
        page(&mallory, "Deed", 0).get_signer().clone(),
        honest.get_created_at(),
    );

    let mut chain = Chain::new();
    chain.append(mine_on(chain.tip(), vec![forged])).unwrap();
    let err = validator().validate_chain(&chain).unwrap_err();
    assert_eq!(err.index, 1);
    assert!(matches!(LedgerError::from(err), LedgerError::Signature(_)));
}

#[test]
fn test_fork_choice_is_deterministic_and_commutative() {
    let signer = EcdsaP256Signer::generate("alice").unwrap();
    let base = signed_chain(&signer, &["Shared"]);

    let mut left = base.clone();
    left.append(mine_on(left.tip(), vec![page(&signer, "Left", 0)])).unwrap();
    let mut right = base.clone();
    right.append(mine_on(right.tip(), vec![page(&signer, "Right", 0)])).unwrap();

    let winner = ForkChoice::canonical(&left, &right);
    assert_eq!(winner, ForkChoice::canonical(&right, &left));
    assert_eq!(winner.height(), 2);
    let expected = if left.tip_hash() < right.tip_hash() { &left } else { &right };
    assert_eq!(winner, expected);

    let loser = if winner == &left { &right } else { &left };
    match ForkChoice::resolve(loser, winner.clone(), &validator()) {
        ForkDecision::Adopt(reorg) => {
            assert_eq!(&reorg.chain, winner);
            assert_eq!(reorg.common_ancestor, 1);
            assert_eq!(reorg.orphaned, loser.tip().get_records().to_vec());
        }
        ForkDecision::KeepLocal => panic!("lower tip hash should win the tie"),
    }
    assert_eq!(
        ForkChoice::resolve(winner, loser.clone(), &validator()),
        ForkDecision::KeepLocal
    );

    let mut longer = loser.clone();
    longer.append(mine_on(longer.tip(), vec![page(&signer, "Tail", 0)])).unwrap();
    assert_eq!(ForkChoice::canonical(winner, &longer), &longer);
    assert_eq!(ForkChoice::canonical(&longer, winner), &longer);
}

#[test]
fn test_chain_file_round_trip() {
    let signer = EcdsaP256Signer::generate("alice").unwrap();
    let chain = signed_chain(&signer, &["Ledger", "Journal", "Diary"]);
    let dir = tempdir().unwrap();
    let store = FileChainStore::new(dir.path().join("chain.dat"));

    assert!(store.load().unwrap().is_none());
    store.save(&chain).unwrap();
    let loaded = store.load_validated(&validator()).unwrap().unwrap();
    assert_eq!(loaded, chain);

    let bytes = fs::read(store.get_path()).unwrap();
    assert_eq!(&bytes[..8], b"PGLEDGER");
    assert_eq!(encode_chain(&decode_chain(&bytes).unwrap()).unwrap(), bytes);
}

#[test]
fn test_corrupt_chain_file_is_left_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.dat");
    fs::write(&path, b"PGLEDGER but not really").unwrap();

    let store = FileChainStore::new(&path);
    assert!(matches!(store.load(), Err(LedgerError::Persistence(_))));
    assert_eq!(fs::read(&path).unwrap(), b"PGLEDGER but not really");
}

#[test]
fn test_invalid_saved_chain_fails_validated_load() {
    let signer = EcdsaP256Signer::generate("alice").unwrap();
    let chain = signed_chain(&signer, &["Only"]);
    let dir = tempdir().unwrap();
    let store = FileChainStore::new(dir.path().join("chain.dat"));
    store.save(&chain).unwrap();

    // saved at difficulty 8, loaded by a node that demands 9
    let strict = Validator::new(Arc::new(EcdsaP256Verifier), DifficultyPolicy::Fixed(9));
    assert!(matches!(
        store.load_validated(&strict),
        Err(LedgerError::Persistence(_))
    ));
    assert_eq!(store.load().unwrap().unwrap(), chain);
}

#[test]
fn test_pages_can_be_found_by_title() {
    let signer = EcdsaP256Signer::generate("alice").unwrap();
    let chain = signed_chain(&signer, &["Contract", "Appendix"]);

    let pages = chain.find_pages_by_title("Contract");
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].get_page_index(), 0);
    assert_eq!(pages[1].get_page_index(), 1);
    assert!(chain.find_pages_by_title("contract").is_empty());
    assert!(chain.contains_page("Appendix", 1));

    let contents: Vec<PageContent> = chain.page_contents().collect();
    assert_eq!(contents.len(), 4);
    assert_eq!(contents[2].title, "Appendix");
    assert_eq!(
        contents[0].text,
        "This is page 0 of Contract. It has two sentences."
    );
}
