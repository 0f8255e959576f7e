//! Search, insert and delete over the on-disk B-tree.
//!
//! Insert uses proactive splitting: a full child is split before the
//! recursion descends into it, so there is never a need to walk back up
//! after the fact. Delete mirrors this with proactive refill: a
//! minimally-filled child is topped up (by rotation or merge) before the
//! recursion descends into it.

use crate::error::Error;
use crate::page::{self, NodeImage, L_KEY};
use crate::pool::PagePool;

/// Finds the smallest index `i` such that `node.key(i) >= key`, by binary
/// search over the node's sorted keys.
fn find_pos(node: &NodeImage, key: &[u8; L_KEY]) -> usize {
    let mut lo = 0usize;
    let mut hi = node.n_keys();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if &node.key(mid) < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Looks up `key` under the subtree rooted at `root`.
pub fn search(pool: &PagePool, root: u32, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    let key = page::pad_key(key)?;
    search_node(pool, root, &key)
}

fn search_node(pool: &PagePool, page: u32, key: &[u8; L_KEY]) -> Result<Option<Vec<u8>>, Error> {
    let node = pool.read_node(page)?;
    let pos = find_pos(&node, key);
    if pos < node.n_keys() && node.key(pos) == *key {
        return Ok(Some(pool.read_data(node.val(pos))?));
    }
    if node.is_leaf() {
        return Ok(None);
    }
    search_node(pool, node.chld(pos), key)
}

/// Inserts or overwrites `key` with `value` under the subtree rooted at
/// `root`. The root page number never changes here: a full root is split
/// but rewritten in place (see [`split_root`]).
pub fn insert(pool: &mut PagePool, root: u32, key: &[u8], value: &[u8]) -> Result<(), Error> {
    let key = page::pad_key(key)?;
    if value.len() > pool.max_value_len() {
        return Err(crate::error::err!(
            InvalidArgument,
            "value of {} bytes exceeds the {}-byte limit for this page size",
            value.len(),
            pool.max_value_len()
        ));
    }

    let root_full = pool.read_node(root)?.n_keys() == pool.k();
    if root_full {
        split_root(pool, root)?;
    }
    insert_node(pool, root, &key, value)
}

fn insert_node(
    pool: &mut PagePool,
    page: u32,
    key: &[u8; L_KEY],
    value: &[u8],
) -> Result<(), Error> {
    let mut node = pool.read_node(page)?;
    let pos = find_pos(&node, key);

    if pos < node.n_keys() && node.key(pos) == *key {
        let old_val_page = node.val(pos);
        let new_val_page = pool.alloc()?;
        pool.write_data(new_val_page, value)?;
        pool.free(old_val_page)?;
        node.set_val(pos, new_val_page);
        pool.write_node(&node)?;
        return Ok(());
    }

    if node.is_leaf() {
        let val_page = pool.alloc()?;
        pool.write_data(val_page, value)?;
        node.open_gap(pos);
        node.set_key(pos, key);
        node.set_val(pos, val_page);
        node.set_n_keys(node.n_keys() + 1);
        pool.write_node(&node)?;
        return Ok(());
    }

    let child = pool.read_node(node.chld(pos))?;
    let mut pos = pos;
    if child.n_keys() == pool.k() {
        split_child(pool, &mut node, pos)?;
        // The split may have promoted a median key/value equal to the one
        // being inserted (the match check above ran before the split, so it
        // couldn't have seen this). Overwrite it in place rather than
        // descending into the child that no longer holds it.
        if key == &node.key(pos) {
            let old_val_page = node.val(pos);
            let new_val_page = pool.alloc()?;
            pool.write_data(new_val_page, value)?;
            pool.free(old_val_page)?;
            node.set_val(pos, new_val_page);
            pool.write_node(&node)?;
            return Ok(());
        } else if key > &node.key(pos) {
            pos += 1;
        }
    }
    let target = node.chld(pos);
    insert_node(pool, target, key, value)
}

/// Splits `root` (already full) in place: half of its entries move into a
/// new left sibling, half into a new right sibling, and `root`'s page is
/// rewritten as a one-key internal node pointing at the two of them. The
/// root's page number is unchanged, so callers never need to track a new
/// root after an insert.
fn split_root(pool: &mut PagePool, root_page: u32) -> Result<(), Error> {
    let r = pool.read_node(root_page)?;
    let k = pool.k();
    let m = k.div_ceil(2) - 1; // ceil(K/2) - 1
    let is_leaf = r.is_leaf();

    let l_page = pool.alloc()?;
    let right_page = pool.alloc()?;
    let mut l = NodeImage::new(pool.page_size(), k, l_page, root_page, is_leaf);
    let mut right = NodeImage::new(pool.page_size(), k, right_page, root_page, is_leaf);

    for i in 0..m {
        l.set_key(i, &r.key(i));
        l.set_val(i, r.val(i));
    }
    if !is_leaf {
        for i in 0..=m {
            l.set_chld(i, r.chld(i));
        }
    }
    l.set_n_keys(m);

    for i in (m + 1)..k {
        right.set_key(i - (m + 1), &r.key(i));
        right.set_val(i - (m + 1), r.val(i));
    }
    if !is_leaf {
        for i in (m + 1)..=k {
            right.set_chld(i - (m + 1), r.chld(i));
        }
    }
    right.set_n_keys(k - m - 1);

    if !is_leaf {
        for i in 0..=l.n_keys() {
            fixup_parent(pool, l.chld(i), l.page())?;
        }
        for i in 0..=right.n_keys() {
            fixup_parent(pool, right.chld(i), right.page())?;
        }
    }

    let sep_key = r.key(m);
    let sep_val = r.val(m);
    let mut new_root = NodeImage::new(pool.page_size(), k, root_page, 0, false);
    new_root.set_n_keys(1);
    new_root.set_key(0, &sep_key);
    new_root.set_val(0, sep_val);
    new_root.set_chld(0, l.page());
    new_root.set_chld(1, right.page());

    pool.write_node(&l)?;
    pool.write_node(&right)?;
    pool.write_node(&new_root)?;
    Ok(())
}

/// Splits `parent.chld(pos)` (already full), moving its upper half into a
/// freshly allocated sibling inserted at `parent.chld(pos + 1)`, and lifting
/// the median key/value up into `parent` at `pos`. Mutates `parent` in
/// memory and persists it, along with the two halves, before returning.
fn split_child(pool: &mut PagePool, parent: &mut NodeImage, pos: usize) -> Result<(), Error> {
    let k = pool.k();
    let m = k.div_ceil(2) - 1;
    let child_page = parent.chld(pos);
    let mut y = pool.read_node(child_page)?;
    let is_leaf = y.is_leaf();

    let z_page = pool.alloc()?;
    let mut z = NodeImage::new(pool.page_size(), k, z_page, parent.page(), is_leaf);

    for i in (m + 1)..k {
        z.set_key(i - (m + 1), &y.key(i));
        z.set_val(i - (m + 1), y.val(i));
    }
    if !is_leaf {
        for i in (m + 1)..=k {
            z.set_chld(i - (m + 1), y.chld(i));
        }
    }
    z.set_n_keys(k - m - 1);

    if !is_leaf {
        for i in 0..=z.n_keys() {
            fixup_parent(pool, z.chld(i), z.page())?;
        }
    }

    let sep_key = y.key(m);
    let sep_val = y.val(m);
    y.set_n_keys(m);

    parent.open_gap(pos);
    parent.set_key(pos, &sep_key);
    parent.set_val(pos, sep_val);
    parent.set_chld(pos + 1, z.page());
    parent.set_n_keys(parent.n_keys() + 1);

    pool.write_node(&y)?;
    pool.write_node(&z)?;
    pool.write_node(parent)?;
    Ok(())
}

fn fixup_parent(pool: &mut PagePool, child_page: u32, new_parent: u32) -> Result<(), Error> {
    let mut child = pool.read_node(child_page)?;
    child.set_parent_page(new_parent);
    pool.write_node(&child)
}

/// Deletes `key` from the subtree rooted at `root`, returning the (possibly
/// new) root page. The root page only ever changes when the tree shrinks:
/// an internal root left with zero keys is replaced by its one remaining
/// child, and the old root's page is freed.
pub fn delete(pool: &mut PagePool, root: u32, key: &[u8]) -> Result<u32, Error> {
    let key = page::pad_key(key)?;
    delete_node(pool, root, &key)?;

    let node = pool.read_node(root)?;
    if !node.is_leaf() && node.n_keys() == 0 {
        let child_page = node.chld(0);
        let mut child = pool.read_node(child_page)?;
        child.set_parent_page(0);
        pool.write_node(&child)?;
        pool.free(root)?;
        return Ok(child_page);
    }
    Ok(root)
}

fn delete_node(pool: &mut PagePool, page: u32, key: &[u8; L_KEY]) -> Result<(), Error> {
    delete_node_inner(pool, page, key, true)
}

/// `free_matched_value` is false only for the recursive removal of a
/// predecessor/successor entry that was just promoted into an ancestor: its
/// value page now belongs to that ancestor's entry, so the leaf must drop
/// the slot without freeing the page underneath it.
fn delete_node_inner(
    pool: &mut PagePool,
    page: u32,
    key: &[u8; L_KEY],
    free_matched_value: bool,
) -> Result<(), Error> {
    let min_keys = pool.k() / 2;
    let mut x = pool.read_node(page)?;
    let pos = find_pos(&x, key);
    let found = pos < x.n_keys() && x.key(pos) == *key;

    if x.is_leaf() {
        if found {
            if free_matched_value {
                let val_page = x.val(pos);
                pool.free(val_page)?;
            }
            x.close_gap(pos);
            x.set_n_keys(x.n_keys() - 1);
            pool.write_node(&x)?;
        }
        return Ok(());
    }

    if found {
        let left_page = x.chld(pos);
        let right_page = x.chld(pos + 1);
        let left = pool.read_node(left_page)?;
        if left.n_keys() > min_keys {
            let (pred_key, pred_val) = find_predecessor(pool, left_page)?;
            pool.free(x.val(pos))?;
            x.set_key(pos, &pred_key);
            x.set_val(pos, pred_val);
            pool.write_node(&x)?;
            return delete_node_inner(pool, left_page, &pred_key, false);
        }
        let right = pool.read_node(right_page)?;
        if right.n_keys() > min_keys {
            let (succ_key, succ_val) = find_successor(pool, right_page)?;
            pool.free(x.val(pos))?;
            x.set_key(pos, &succ_key);
            x.set_val(pos, succ_val);
            pool.write_node(&x)?;
            return delete_node_inner(pool, right_page, &succ_key, false);
        }
        merge_nodes(pool, &mut x, pos)?;
        pool.write_node(&x)?;
        return delete_node_inner(pool, left_page, key, free_matched_value);
    }

    let child_page = x.chld(pos);
    let child = pool.read_node(child_page)?;
    if child.n_keys() > min_keys {
        return delete_node_inner(pool, child_page, key, free_matched_value);
    }

    let left_sibling_pos = if pos > 0 { Some(pos - 1) } else { None };
    let right_sibling_pos = if pos < x.n_keys() { Some(pos) } else { None };

    if let Some(sep_pos) = left_sibling_pos {
        let ls = pool.read_node(x.chld(sep_pos))?;
        if ls.n_keys() > min_keys {
            rotate_right(pool, &mut x, sep_pos)?;
            pool.write_node(&x)?;
            return delete_node_inner(pool, child_page, key, free_matched_value);
        }
    }
    if let Some(sep_pos) = right_sibling_pos {
        let rs = pool.read_node(x.chld(sep_pos + 1))?;
        if rs.n_keys() > min_keys {
            rotate_left(pool, &mut x, sep_pos)?;
            pool.write_node(&x)?;
            return delete_node_inner(pool, child_page, key, free_matched_value);
        }
    }

    if let Some(sep_pos) = right_sibling_pos {
        merge_nodes(pool, &mut x, sep_pos)?;
        pool.write_node(&x)?;
        delete_node_inner(pool, child_page, key, free_matched_value)
    } else {
        let sep_pos = left_sibling_pos.expect("internal node with no siblings on either side");
        let merged_into = x.chld(sep_pos);
        merge_nodes(pool, &mut x, sep_pos)?;
        pool.write_node(&x)?;
        delete_node_inner(pool, merged_into, key, free_matched_value)
    }
}

fn find_predecessor(pool: &PagePool, subtree_root: u32) -> Result<([u8; L_KEY], u32), Error> {
    let mut node = pool.read_node(subtree_root)?;
    while !node.is_leaf() {
        node = pool.read_node(node.chld(node.n_keys()))?;
    }
    let last = node.n_keys() - 1;
    Ok((node.key(last), node.val(last)))
}

fn find_successor(pool: &PagePool, subtree_root: u32) -> Result<([u8; L_KEY], u32), Error> {
    let mut node = pool.read_node(subtree_root)?;
    while !node.is_leaf() {
        node = pool.read_node(node.chld(0))?;
    }
    Ok((node.key(0), node.val(0)))
}

/// Moves the last entry of `parent.chld(sep_pos)` (the left sibling) up
/// through `parent`'s separator at `sep_pos` and down into the front of
/// `parent.chld(sep_pos + 1)` (the child being topped up).
fn rotate_right(pool: &mut PagePool, parent: &mut NodeImage, sep_pos: usize) -> Result<(), Error> {
    let mut ls = pool.read_node(parent.chld(sep_pos))?;
    let mut child = pool.read_node(parent.chld(sep_pos + 1))?;
    let is_leaf = child.is_leaf();

    child.open_gap_at_front();
    child.set_key(0, &parent.key(sep_pos));
    child.set_val(0, parent.val(sep_pos));
    child.set_n_keys(child.n_keys() + 1);

    let ls_last = ls.n_keys() - 1;
    parent.set_key(sep_pos, &ls.key(ls_last));
    parent.set_val(sep_pos, ls.val(ls_last));

    if !is_leaf {
        let moved_child = ls.chld(ls.n_keys());
        child.set_chld(0, moved_child);
        fixup_parent(pool, moved_child, child.page())?;
    }
    ls.set_n_keys(ls_last);

    pool.write_node(&ls)?;
    pool.write_node(&child)?;
    Ok(())
}

/// Moves the first entry of `parent.chld(sep_pos + 1)` (the right sibling)
/// up through `parent`'s separator at `sep_pos` and down into the end of
/// `parent.chld(sep_pos)` (the child being topped up).
fn rotate_left(pool: &mut PagePool, parent: &mut NodeImage, sep_pos: usize) -> Result<(), Error> {
    let mut rs = pool.read_node(parent.chld(sep_pos + 1))?;
    let mut child = pool.read_node(parent.chld(sep_pos))?;
    let is_leaf = child.is_leaf();

    let n = child.n_keys();
    child.set_key(n, &parent.key(sep_pos));
    child.set_val(n, parent.val(sep_pos));
    child.set_n_keys(n + 1);

    parent.set_key(sep_pos, &rs.key(0));
    parent.set_val(sep_pos, rs.val(0));

    if !is_leaf {
        let moved_child = rs.chld(0);
        child.set_chld(n + 1, moved_child);
        fixup_parent(pool, moved_child, child.page())?;
    }

    rs.close_gap_at_front();
    rs.set_n_keys(rs.n_keys() - 1);

    pool.write_node(&rs)?;
    pool.write_node(&child)?;
    Ok(())
}

/// Merges `parent.chld(sep_pos)` (left) and `parent.chld(sep_pos + 1)`
/// (right) into the left node, with `parent`'s separator at `sep_pos`
/// sandwiched between them. The right node's page is freed, and `parent`'s
/// separator and right child pointer are removed.
fn merge_nodes(pool: &mut PagePool, parent: &mut NodeImage, sep_pos: usize) -> Result<(), Error> {
    let mut left = pool.read_node(parent.chld(sep_pos))?;
    let right = pool.read_node(parent.chld(sep_pos + 1))?;
    let is_leaf = left.is_leaf();

    let base = left.n_keys();
    left.set_key(base, &parent.key(sep_pos));
    left.set_val(base, parent.val(sep_pos));

    for i in 0..right.n_keys() {
        left.set_key(base + 1 + i, &right.key(i));
        left.set_val(base + 1 + i, right.val(i));
    }
    if !is_leaf {
        for i in 0..=right.n_keys() {
            left.set_chld(base + 1 + i, right.chld(i));
        }
    }
    left.set_n_keys(base + 1 + right.n_keys());

    if !is_leaf {
        for i in (base + 1)..=left.n_keys() {
            fixup_parent(pool, left.chld(i), left.page())?;
        }
    }

    parent.close_gap(sep_pos);
    parent.set_n_keys(parent.n_keys() - 1);

    pool.free(right.page())?;
    pool.write_node(&left)?;
    Ok(())
}
