use fracmash::cmd::ComputeParameters;
use fracmash::encodings::HashFunctions;
use fracmash::prelude::*;
use fracmash::selection::Selection;
use fracmash::signature::{Signature, SigsTrait};
use fracmash::sketch::minhash::KmerMinHash;

const SEQ: &[u8] = b"TGCCGCCCAGCACCGGGTGACTAGGTTGAGCCATGATTAACCTGCAATGA";

fn build_sig(name: &str, track_abundance: bool) -> Signature {
    let params = ComputeParameters::builder()
        .ksizes(vec![21])
        .scaled(1u64)
        .num_hashes(0u32)
        .track_abundance(track_abundance)
        .build();

    let mut sig = Signature::from_params(&params);
    sig.set_name(name);
    sig.add_sequence(SEQ, false).unwrap();
    sig.add_sequence(SEQ, false).unwrap();
    sig
}

#[test]
fn roundtrip_plain() {
    let sig = build_sig("roundtrip", false);

    let mut buffer = vec![];
    sig.to_writer(&mut buffer).unwrap();

    let loaded = Signature::from_reader(&buffer[..]).unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0], sig);
    assert_eq!(loaded[0].md5sum(), sig.md5sum());
    loaded[0].check_md5sum().unwrap();
}

#[test]
fn roundtrip_with_abundance() {
    let sig = build_sig("abund", true);

    let mut buffer = vec![];
    sig.to_writer(&mut buffer).unwrap();

    let loaded = Signature::from_reader(&buffer[..]).unwrap();
    let mh = loaded[0].minhash().unwrap();
    assert!(mh.track_abundance());
    // every k-mer was added twice
    assert!(mh.abunds().unwrap().iter().all(|&v| v == 2));
    assert_eq!(loaded[0].md5sum(), sig.md5sum());
}

#[test]
fn roundtrip_gzip() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("out.sig.gz");

    let sig = build_sig("gz", false);
    Signature::save_to_path(&[sig.clone()], &path).unwrap();

    // the file is actually gzip-compressed
    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);

    let loaded = Signature::from_path(&path).unwrap();
    assert_eq!(loaded[0].md5sum(), sig.md5sum());
}

#[test]
fn md5sum_ignores_name_and_filename() {
    let mut a = build_sig("one name", false);
    let b = build_sig("completely different", false);

    a.set_filename("somewhere/else.fa");
    assert_eq!(a.md5sum(), b.md5sum());
}

#[test]
fn wire_format_fields() {
    let sig = build_sig("wire", false);

    let mut buffer = vec![];
    sig.to_writer(&mut buffer).unwrap();

    let parsed: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
    let outer = &parsed[0];
    assert_eq!(outer["class"], "sourmash_signature");
    assert_eq!(outer["hash_function"], "0.murmur64");
    assert_eq!(outer["license"], "CC0");
    assert_eq!(outer["name"], "wire");

    let record = &outer["signatures"][0];
    assert_eq!(record["ksize"], 21);
    assert_eq!(record["seed"], 42);
    assert_eq!(record["molecule"], "DNA");
    assert!(record["mins"].is_array());
    assert!(record["md5sum"].is_string());

    // mins are serialized in ascending order
    let mins: Vec<u64> = record["mins"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    assert!(mins.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn load_rejects_checksum_mismatch() {
    let sig = build_sig("tampered", false);

    let mut buffer = vec![];
    sig.to_writer(&mut buffer).unwrap();

    let text = String::from_utf8(buffer).unwrap();
    let tampered = text.replacen(&sig.md5sum(), "0123456789abcdef0123456789abcdef", 1);

    let err = Signature::load_signatures(tampered.as_bytes(), None, false);
    assert!(err.is_err());

    // and the escape hatch works
    let sigs = Signature::load_signatures(tampered.as_bytes(), None, true).unwrap();
    assert_eq!(sigs.len(), 1);
}

#[test]
fn load_rejects_num_plus_scaled() {
    let data = r#"[{
        "class": "sourmash_signature",
        "hash_function": "0.murmur64",
        "signatures": [{
            "num": 500, "ksize": 21, "seed": 42, "max_hash": 1000,
            "md5sum": "00000000000000000000000000000000",
            "mins": [1, 2, 3], "molecule": "DNA"
        }]
    }]"#;

    assert!(Signature::from_reader(data.as_bytes()).is_err());
}

#[test]
fn load_signatures_flattens_and_selects() {
    let params = ComputeParameters::builder()
        .ksizes(vec![21, 31])
        .scaled(1u64)
        .num_hashes(0u32)
        .build();

    let mut sig = Signature::from_params(&params);
    sig.set_name("multi");
    sig.add_sequence(SEQ, false).unwrap();
    assert_eq!(sig.size(), 2);

    let mut buffer = vec![];
    sig.to_writer(&mut buffer).unwrap();

    // flattening: one signature per sketch
    let flat = Signature::load_signatures(&buffer[..], None, false).unwrap();
    assert_eq!(flat.len(), 2);
    for sig in &flat {
        assert_eq!(sig.size(), 1);
    }

    // selection narrows to a single ksize
    let mut selection = Selection::default();
    selection.set_ksize(31);
    let selected = Signature::load_signatures(&buffer[..], Some(&selection), false).unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].minhash().unwrap().ksize(), 31);
}

#[test]
fn selection_with_downsample() {
    let mut mh = KmerMinHash::new(1000, 21, HashFunctions::Murmur64Dna, 42, false, 0);
    for i in 0..50000u64 {
        mh.add_hash(i.wrapping_mul(11400714819323198485));
    }
    let mut sig = Signature::default();
    sig.push(mh);

    let mut selection = Selection::default();
    selection.set_scaled(2000);
    let selected = sig.select(&selection).unwrap();
    assert_eq!(selected.minhash().unwrap().scaled(), 2000);
}

#[test]
fn selection_scaled_too_low() {
    let sig = build_sig("s1000", false);
    let sig = {
        // resketch at scaled=1000
        let mut mh = KmerMinHash::new(1000, 21, HashFunctions::Murmur64Dna, 42, false, 0);
        mh.add_sequence(SEQ, false).unwrap();
        let mut s = sig;
        s.reset_sketches();
        s.push(mh);
        s
    };

    // asking for a finer scaled drops the sketch
    let mut selection = Selection::default();
    selection.set_scaled(100);
    let selected = sig.select(&selection).unwrap();
    assert_eq!(selected.size(), 0);
}

#[test]
fn update_freezes_back() {
    let sig = build_sig("frozen", false);
    let before = sig.md5sum();

    let sig = sig
        .update(|sketches| {
            for mh in sketches.iter_mut() {
                mh.add_hash(12345);
            }
            Ok(())
        })
        .unwrap();

    assert_ne!(sig.md5sum(), before);
    sig.check_md5sum().unwrap();
}
