//! Streaming consumption of live query results.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::decode::Rows;
use crate::query::QuerySubscription;

/// A live query's result snapshots as an async stream.
///
/// The first item is the snapshot current at subscription time; every
/// subsequent item is a fresh snapshot produced by a matching write or a
/// reconfiguration. Dropping the stream detaches the underlying listener,
/// after which the stream would end once drained.
pub struct RowStream {
   inner: UnboundedReceiverStream<Rows>,
   subscription: Option<QuerySubscription>,
}

impl RowStream {
   pub(crate) fn new(rx: UnboundedReceiver<Rows>, subscription: QuerySubscription) -> Self {
      Self {
         inner: UnboundedReceiverStream::new(rx),
         subscription: Some(subscription),
      }
   }

   /// Detaches the listener now. The stream still yields snapshots queued
   /// before detachment, then ends.
   pub fn unsubscribe(&mut self) {
      if let Some(subscription) = self.subscription.take() {
         subscription.unsubscribe();
      }
   }
}

impl Stream for RowStream {
   type Item = Rows;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      Pin::new(&mut self.inner).poll_next(cx)
   }
}
