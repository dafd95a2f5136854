//! Builds a theme's nested reply tree from the flat `posts` rows.

use std::collections::HashMap;

use hetaoshu_shared::{Post, PostImage, ReplyTreeNode};

/// Single pass over the active posts of a theme: an adjacency map keyed by
/// parent id, then recursive materialization from the theme's first post.
///
/// Children keep the order the rows came in (query order). Posts whose
/// parent is missing or inactive never become reachable and are dropped.
/// Each entry is consumed when visited, so the walk terminates even if
/// malformed data forms a parent cycle. Returns `None` when the root
/// itself is missing or inactive.
pub fn build_reply_tree(
    root_id: i64,
    posts: Vec<(Post, Vec<PostImage>)>,
) -> Option<ReplyTreeNode> {
    let mut by_id: HashMap<i64, (Post, Vec<PostImage>)> = HashMap::with_capacity(posts.len());
    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();

    for (post, images) in posts {
        if let Some(parent_id) = post.parent_id {
            children.entry(parent_id).or_default().push(post.id);
        }
        by_id.insert(post.id, (post, images));
    }

    materialize(root_id, &mut by_id, &children)
}

fn materialize(
    id: i64,
    by_id: &mut HashMap<i64, (Post, Vec<PostImage>)>,
    children: &HashMap<i64, Vec<i64>>,
) -> Option<ReplyTreeNode> {
    // remove() doubles as the visited guard: a second visit finds nothing.
    let (post, images) = by_id.remove(&id)?;
    let child_nodes = children
        .get(&id)
        .map(|ids| {
            ids.iter()
                .filter_map(|child_id| materialize(*child_id, by_id, children))
                .collect()
        })
        .unwrap_or_default();

    Some(ReplyTreeNode {
        post,
        images,
        children: child_nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hetaoshu_shared::User;

    fn author() -> User {
        User {
            id: 1,
            student_id: "20210001".to_string(),
            email: "20210001@slai.edu.cn".to_string(),
            name: Some("0001".to_string()),
            is_active: true,
            is_staff: false,
            date_joined: "2026-01-01T00:00:00.000000Z".to_string(),
        }
    }

    fn post(id: i64, parent_id: Option<i64>) -> (Post, Vec<PostImage>) {
        (
            Post {
                id,
                theme_id: 1,
                parent_id,
                title: None,
                content: Some(format!("post {id}")),
                author: author(),
                is_active: true,
                created_at: "2026-01-01T00:00:00.000000Z".to_string(),
                updated_at: "2026-01-01T00:00:00.000000Z".to_string(),
            },
            Vec::new(),
        )
    }

    #[test]
    fn nests_chain_of_replies() {
        let tree =
            build_reply_tree(1, vec![post(1, None), post(2, Some(1)), post(3, Some(2))]).unwrap();
        assert_eq!(tree.post.id, 1);
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].post.id, 2);
        assert_eq!(tree.children[0].children[0].post.id, 3);
        assert!(tree.children[0].children[0].children.is_empty());
    }

    #[test]
    fn siblings_keep_query_order() {
        let tree = build_reply_tree(
            1,
            vec![post(1, None), post(4, Some(1)), post(2, Some(1)), post(3, Some(1))],
        )
        .unwrap();
        let order: Vec<i64> = tree.children.iter().map(|c| c.post.id).collect();
        assert_eq!(order, vec![4, 2, 3]);
    }

    #[test]
    fn orphans_are_dropped() {
        // Post 3 replies to post 99, which is not among the active rows.
        let tree =
            build_reply_tree(1, vec![post(1, None), post(2, Some(1)), post(3, Some(99))]).unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].post.id, 2);
    }

    #[test]
    fn missing_root_fails() {
        assert!(build_reply_tree(7, vec![post(1, None)]).is_none());
    }

    #[test]
    fn malformed_cycle_terminates() {
        // 2 and 3 point at each other; 2 is also a child of the root, so the
        // walk enters the cycle and must not loop.
        let tree =
            build_reply_tree(1, vec![post(1, None), post(2, Some(3)), post(3, Some(2))]);
        let tree = tree.unwrap();
        assert_eq!(tree.post.id, 1);
        assert!(tree.children.is_empty());

        let mut cyclic = vec![post(1, None), post(2, Some(1)), post(3, Some(2))];
        cyclic[1].0.parent_id = Some(3);
        // Now 2 ← 3 and 3 ← 2 while 2 still hangs nothing off the root.
        let tree = build_reply_tree(1, cyclic).unwrap();
        assert_eq!(tree.post.id, 1);
    }
}
