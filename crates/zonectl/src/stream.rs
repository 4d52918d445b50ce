//! Channel plumbing shared by the pipeline stages.

use tokio::sync::mpsc;

use hvac_types::SIGNAL_BUFFER;

/// Interleave several receivers into one, in arrival order
///
/// The merged stream ends once every input has ended.
pub fn merge<T: Send + 'static>(inputs: Vec<mpsc::Receiver<T>>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);

    for mut input in inputs {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
    }

    rx
}
