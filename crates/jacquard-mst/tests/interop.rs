//! Interoperability tests against known MST vectors
//!
//! Key heights and the two-key root come from atproto-interop-tests:
//! https://github.com/bluesky-social/atproto-interop-tests/tree/main/mst
//!
//! The larger tree roots were produced by an independent implementation of
//! the same node format.

use std::sync::Arc;

use cid::Cid;
use jacquard_mst::mst::node::{EMPTY_NODE_BYTES, EMPTY_NODE_CID, Node};
use jacquard_mst::mst::util::{common_prefix_len, layer_for_key};
use jacquard_mst::{MemoryBlockStore, Mst, WriteOp};
use rand::Rng;
use smol_str::SmolStr;

/// Leaf value used by every tree vector below
const LEAF_VALUE: &str = "bafyreie5cvv4h45feadgeuwhbcutmh6t2ceseocckahdoe6uat64zmz454";

const ROOT_40_RECORDS: &str = "bafyreidrma66nw2kurz5nucyyb5axtq3mlrilk5kqjntahq5fbvvdmn6ma";
const ROOT_40_WITHOUT_0019: &str = "bafyreicblzcxpud5m7pqv6thpnbd22cj3ltgssrcp4tj7atpmqosww3roy";
const ROOT_40_AFTER_COMMIT: &str = "bafyreigxb6ysx3p4i2ouvcejvvtasj6hne54fhoivmwzbw5lg6pbhllpoe";
const ROOT_200_RECORDS: &str = "bafyreicbwnzsaqew7zosgp37q5spxxpxboun3blisbllildmqsku3putwq";
const ROOT_LAYER_GAP: &str = "bafyreigqefmpdr24hiw5ie4fsxgfd2qk3zselrkqjcf7n7wbd7kg55uhxm";
const ROOT_SINGLE: &str = "bafyreift3a32du2fnyuzcen52rxlp6wagd5fvu4b723pbtzewyjcfujnim";
const ROOT_TWO_POSTS: &str = "bafyreigb2sgtofzafkjszxg6a3umd4r37ujajcbjlxmxx33q34zle6hyr4";
const ROOT_POST_2: &str = "bafyreibqfdehv3buq45n6zxc37l5ywfs54ekyykdv6bbuynjthusxreefq";

fn cid(s: &str) -> Cid {
    s.parse().unwrap()
}

fn record(n: usize) -> String {
    format!("com.example.record/{:04}", n)
}

/// Generate a random key at a specific layer
///
/// Same approach as gen_keys.py from atproto-interop-tests.
fn gen_key_at_layer(letter: char, layer: usize) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let num: u32 = rng.gen_range(0..1_000_000);
        let key = format!("{}{}/{:06}", letter, layer, num);
        if layer_for_key(&key) == layer {
            return key;
        }
    }
}

async fn build(keys: impl IntoIterator<Item = String>) -> Mst<MemoryBlockStore> {
    let value = cid(LEAF_VALUE);
    let mut mst = Mst::new(Arc::new(MemoryBlockStore::new()));
    for key in keys {
        mst = mst.insert_or_fail(&key, value).await.unwrap();
    }
    mst
}

#[test]
fn test_layer_for_key_interop() {
    let vectors = [
        ("", 0),
        ("asdf", 0),
        ("2653ae71", 0),
        ("blue", 1),
        ("app.bsky.feed.post/454397e440ec", 4),
        ("app.bsky.feed.post/9adeb165882c", 8),
        ("com.example.post/1", 2),
        ("com.example.post/2", 1),
        ("com.example.record/0000", 0),
        ("com.example.record/0001", 1),
        ("com.example.record/0024", 2),
        ("com.example.record/0019", 3),
        ("com.example.record/0234", 4),
        ("com.example.record/1330", 5),
        ("com.example.record/8746", 6),
        ("com.example.record/16963", 7),
    ];

    for (key, height) in vectors {
        assert_eq!(
            layer_for_key(key),
            height,
            "layer_for_key({:?}) expected {}",
            key,
            height
        );
    }
}

#[test]
fn test_common_prefix_interop() {
    let vectors = [
        ("", "", 0),
        ("abc", "abc", 3),
        ("", "abc", 0),
        ("abc", "", 0),
        ("ab", "abc", 2),
        ("abc", "ab", 2),
        ("abcde", "abc", 3),
        ("abcde", "abc1", 3),
        ("abcde", "abb", 2),
        ("abcde", "qbb", 0),
        ("com.example.record/3jqfcqzm3ft2j", "com.example.record/3jqfcqzm3fz2j", 29),
    ];

    for (left, right, len) in vectors {
        assert_eq!(
            common_prefix_len(left, right),
            len,
            "common_prefix_len({:?}, {:?})",
            left,
            right
        );
    }
}

#[tokio::test]
async fn test_empty_tree_vector() {
    let mst = build([]).await;
    assert_eq!(mst.root().unwrap(), cid(EMPTY_NODE_CID));

    let empty = Node::empty().unwrap();
    assert_eq!(empty.cid(), &cid(EMPTY_NODE_CID));
    assert_eq!(empty.bytes().as_ref(), EMPTY_NODE_BYTES);
    assert_eq!(hex::encode(EMPTY_NODE_BYTES), "a2616580616cf6");
}

#[tokio::test]
async fn test_two_key_vector() {
    let value = cid(LEAF_VALUE);
    let mst = Mst::new(Arc::new(MemoryBlockStore::new()))
        .insert_or_fail("com.example.record/3jqfcqzm3fz2j", value)
        .await
        .unwrap()
        .insert_or_fail("com.example.record/3jqfcqzm3ft2j", value)
        .await
        .unwrap();

    assert_eq!(
        mst.root().unwrap(),
        cid("bafyreidfcktqnfmykz2ps3dbul35pepleq7kvv526g47xahuz3rqtptmky")
    );
    assert_eq!(mst.node_blocks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_tree_vectors() {
    let cases: Vec<(Vec<String>, &str, usize)> = vec![
        (vec![record(0)], ROOT_SINGLE, 1),
        ((0..40).map(record).collect(), ROOT_40_RECORDS, 17),
        (
            (0..40).filter(|i| *i != 19).map(record).collect(),
            ROOT_40_WITHOUT_0019,
            13,
        ),
        ((0..200).map(record).collect(), ROOT_200_RECORDS, 58),
        // layer 0 keys under a layer 7 key: one node per intermediate layer
        (vec![record(0), record(2), record(16963)], ROOT_LAYER_GAP, 8),
        (
            vec!["com.example.post/1".into(), "com.example.post/2".into()],
            ROOT_TWO_POSTS,
            2,
        ),
    ];

    for (keys, expected_root, expected_blocks) in cases {
        let mst = build(keys.clone()).await;
        assert_eq!(
            mst.root().unwrap(),
            cid(expected_root),
            "root mismatch for {} keys",
            keys.len()
        );
        assert_eq!(mst.node_blocks().await.unwrap().len(), expected_blocks);
    }
}

#[tokio::test]
async fn test_insertion_order_does_not_matter() {
    let forward = build((0..40).map(record)).await;
    let reverse = build((0..40).rev().map(record)).await;

    assert_eq!(forward.root().unwrap(), cid(ROOT_40_RECORDS));
    assert_eq!(reverse.root().unwrap(), cid(ROOT_40_RECORDS));
}

#[tokio::test]
async fn test_delete_reaches_vector() {
    let mst = build((0..40).map(record)).await;
    let mst = mst.delete(&record(19)).await.unwrap();
    assert_eq!(mst.root().unwrap(), cid(ROOT_40_WITHOUT_0019));

    // removing the top layer key collapses the root
    let posts = build(["com.example.post/1".into(), "com.example.post/2".into()]).await;
    let posts = posts.delete("com.example.post/1").await.unwrap();
    assert_eq!(posts.root().unwrap(), cid(ROOT_POST_2));

    // removing the layer 7 key trims the chain of single-pointer nodes
    let gap = build([record(0), record(2), record(16963)]).await;
    let gap = gap.delete(&record(16963)).await.unwrap();
    assert_eq!(gap.root().unwrap(), build([record(0), record(2)]).await.root().unwrap());
}

#[tokio::test]
async fn test_commit_vector_incremental() {
    let adds = [record(1330), record(8746)];
    let dels = [record(19), record(1)];

    let mut mst = build((0..40).map(record)).await;
    assert_eq!(mst.root().unwrap(), cid(ROOT_40_RECORDS));

    for key in &adds {
        mst = mst.insert_or_fail(key, cid(LEAF_VALUE)).await.unwrap();
    }
    for key in &dels {
        mst = mst.delete(key).await.unwrap();
    }

    assert_eq!(mst.root().unwrap(), cid(ROOT_40_AFTER_COMMIT));
    assert_eq!(mst.node_blocks().await.unwrap().len(), 16);
}

#[tokio::test]
async fn test_commit_vector_batch() {
    let value = cid(LEAF_VALUE);
    let before = build((0..40).map(record)).await;

    let ops = vec![
        WriteOp::Create {
            key: SmolStr::new(record(1330)),
            cid: value,
        },
        WriteOp::Delete {
            key: SmolStr::new(record(19)),
            prev: Some(value),
        },
        WriteOp::Create {
            key: SmolStr::new(record(8746)),
            cid: value,
        },
        WriteOp::Delete {
            key: SmolStr::new(record(1)),
            prev: None,
        },
    ];

    let after = before.batch(&ops).await.unwrap();
    assert_eq!(after.root().unwrap(), cid(ROOT_40_AFTER_COMMIT));
    assert_eq!(before.root().unwrap(), cid(ROOT_40_RECORDS));
}

#[tokio::test]
async fn test_commit_vector_diff() {
    let before = build((0..40).map(record)).await;
    let after = build(
        (0..40)
            .filter(|i| *i != 1 && *i != 19)
            .map(record)
            .chain([record(1330), record(8746)]),
    )
    .await;
    assert_eq!(after.root().unwrap(), cid(ROOT_40_AFTER_COMMIT));

    let diff = before.diff(&after).await.unwrap();

    let creates: Vec<String> = diff.creates.iter().map(|(k, _)| k.to_string()).collect();
    let deletes: Vec<String> = diff.deletes.iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(creates, vec![record(1330), record(8746)]);
    assert_eq!(deletes, vec![record(1), record(19)]);
    assert!(diff.updates.is_empty());

    // the new root is always among the new blocks, the old root among the removed
    assert!(diff.new_mst_blocks.contains_key(&cid(ROOT_40_AFTER_COMMIT)));
    assert!(diff.removed_mst_blocks.contains(&cid(ROOT_40_RECORDS)));
}

#[tokio::test]
async fn test_generated_keys_at_specific_layers() {
    let mut mst = Mst::new(Arc::new(MemoryBlockStore::new()));
    let value = cid(LEAF_VALUE);

    let mut keys = Vec::new();
    for layer in 0..=5 {
        let key = gen_key_at_layer('T', layer);
        assert_eq!(layer_for_key(&key), layer);
        keys.push(key);
    }

    for key in &keys {
        mst = mst.insert_or_fail(key, value).await.unwrap();
    }

    for key in &keys {
        assert_eq!(mst.get(key).await.unwrap(), value);
    }

    // the root sits at the highest layer in the tree
    let root = mst.root().unwrap();
    let blocks = mst.node_blocks().await.unwrap();
    assert_eq!(blocks[0].0, root);
    let root_node = Node::decode(root, blocks[0].1.clone(), 5, true).unwrap();
    assert_eq!(root_node.layer(), 5);
}
