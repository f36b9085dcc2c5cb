mod event;
mod model;

pub use event::{EventDecodeError, LikeChangedEvent, ViewEvent, EVENT_VERSION};
pub use model::{
  Article, ArticleMeta, NewArticle, NewReply, Reply, ReplyMeta, ReplyNode, ReplyPage, Target,
  TargetType, A_LIKE_COUNT, A_REPLY_COUNT, A_VISIT_COUNT, F_CHILDREN_COUNT,
  F_LIKE_COUNT,
};
