//! Cache key namespace.
//!
//! Every key is `<prefix>:<id>[:<suffix>]` or, for like state,
//! `likes:<field>:<targetType>:<id>`. Ids are integers and never contain the
//! separator, so distinct logical keys never collide. Keys carry no instance
//! state and are stable across restarts.

use crate::types::{Target, TargetType};

const SPLIT: &str = ":";

const PREFIX_ARTICLE: &str = "article";
const PREFIX_REPLY: &str = "reply";
const PREFIX_BOARD: &str = "board";
const PREFIX_USER: &str = "user";
const PREFIX_LIKES: &str = "likes";

const SUFFIX_CONTENT: &str = "content";
const SUFFIX_REPLIES: &str = "replies";
const SUFFIX_CHILDREN: &str = "children";
const SUFFIX_ARTICLES: &str = "articles";

const FIELD_USER_TARGET_SET: &str = "user_target_set";
const FIELD_TARGET_COUNT: &str = "target_count";

/// Member written into an empty ranked set to mark "confirmed absent".
pub const EMPTY_SENTINEL: &str = "__empty__";

/// Hash field written into an empty projection to mark "confirmed absent".
pub const ABSENT_FIELD: &str = "__absent__";

/// Article metadata hash.
pub fn article(article_id: i64) -> String {
  [PREFIX_ARTICLE, &article_id.to_string()].join(SPLIT)
}

/// Article body text.
pub fn article_content(article_id: i64) -> String {
  [PREFIX_ARTICLE, &article_id.to_string(), SUFFIX_CONTENT].join(SPLIT)
}

/// Users currently liking an article. Same logical entity as the article's
/// like set.
pub fn article_likers(article_id: i64) -> String {
  like_set(&Target::article(article_id))
}

/// Ranked set of a board's articles.
pub fn board_articles(board_id: i64) -> String {
  [PREFIX_BOARD, &board_id.to_string(), SUFFIX_ARTICLES].join(SPLIT)
}

/// Ranked set of an article's top-level replies.
pub fn article_replies(article_id: i64) -> String {
  [PREFIX_ARTICLE, &article_id.to_string(), SUFFIX_REPLIES].join(SPLIT)
}

/// Reply metadata hash.
pub fn reply(reply_id: i64) -> String {
  [PREFIX_REPLY, &reply_id.to_string()].join(SPLIT)
}

/// Ranked set of a reply's direct children.
pub fn reply_children(reply_id: i64) -> String {
  [PREFIX_REPLY, &reply_id.to_string(), SUFFIX_CHILDREN].join(SPLIT)
}

/// Set of user ids currently liking a target.
pub fn like_set(target: &Target) -> String {
  likes_key(FIELD_USER_TARGET_SET, target.kind, target.id)
}

/// Like counter of a target.
pub fn like_count(target: &Target) -> String {
  likes_key(FIELD_TARGET_COUNT, target.kind, target.id)
}

/// User projection.
pub fn user(user_id: i64) -> String {
  [PREFIX_USER, &user_id.to_string()].join(SPLIT)
}

fn likes_key(field: &str, kind: TargetType, id: i64) -> String {
  [PREFIX_LIKES, field, kind.as_str(), &id.to_string()].join(SPLIT)
}

/// The other half of a target's like state: the counter for a like set, the
/// like set for a counter. The two keys live and die together.
pub fn like_companion(key: &str) -> Option<String> {
  let rest = key.strip_prefix(PREFIX_LIKES)?.strip_prefix(SPLIT)?;
  let (field, tail) = rest.split_once(SPLIT)?;
  let other = match field {
    FIELD_USER_TARGET_SET => FIELD_TARGET_COUNT,
    FIELD_TARGET_COUNT => FIELD_USER_TARGET_SET,
    _ => return None,
  };
  Some([PREFIX_LIKES, other, tail].join(SPLIT))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_key_formats() {
    assert_eq!(article(101), "article:101");
    assert_eq!(article_content(101), "article:101:content");
    assert_eq!(article_replies(101), "article:101:replies");
    assert_eq!(reply(5), "reply:5");
    assert_eq!(reply_children(5), "reply:5:children");
    assert_eq!(board_articles(2), "board:2:articles");
    assert_eq!(user(9), "user:9");
    assert_eq!(
      like_set(&Target::article(101)),
      "likes:user_target_set:article:101"
    );
    assert_eq!(
      like_count(&Target::reply(7)),
      "likes:target_count:reply:7"
    );
  }

  #[test]
  fn test_article_likers_is_the_article_like_set() {
    assert_eq!(article_likers(3), like_set(&Target::article(3)));
  }

  #[test]
  fn test_keys_are_injective() {
    let mut seen = HashSet::new();
    for id in [0_i64, 1, 10, 11, 101, -1] {
      let keys = [
        article(id),
        article_content(id),
        article_replies(id),
        board_articles(id),
        reply(id),
        reply_children(id),
        user(id),
        like_set(&Target::article(id)),
        like_set(&Target::reply(id)),
        like_count(&Target::article(id)),
        like_count(&Target::reply(id)),
      ];
      for key in keys {
        assert!(seen.insert(key.clone()), "duplicate key {}", key);
      }
    }
  }

  #[test]
  fn test_like_companion_pairs_set_and_counter() {
    let target = Target::reply(12);
    assert_eq!(like_companion(&like_set(&target)), Some(like_count(&target)));
    assert_eq!(like_companion(&like_count(&target)), Some(like_set(&target)));
    assert_eq!(like_companion(&reply(12)), None);
    assert_eq!(like_companion("likes:other:reply:12"), None);
  }

  #[test]
  fn test_keys_are_stable() {
    assert_eq!(reply_children(42), reply_children(42));
    assert_eq!(like_count(&Target::article(1)), like_count(&Target::article(1)));
  }
}
