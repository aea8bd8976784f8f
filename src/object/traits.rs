use serde::{Deserialize, Serialize};

use crate::{object::Meta, query::IndexMeta};

/// A shared entity persisted as an object record.
///
/// `TYPE` names the record table partition. `index_meta` lists the fields
/// that [`Query`](crate::query::Query) may filter and sort on; anything not
/// listed there is only reachable by id.
pub trait Object: Serialize + for<'de> Deserialize<'de> + Sized + Send + Sync + 'static {
    const TYPE: &'static str;

    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn meta(&self) -> &Meta;

    fn meta_mut(&mut self) -> &mut Meta;

    fn index_meta(&self) -> IndexMeta;

    fn id(&self) -> &str {
        self.meta().id()
    }
}
