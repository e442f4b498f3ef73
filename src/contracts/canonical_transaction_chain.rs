use ethers::prelude::*;

abigen!(
    CanonicalTransactionChain,
    r#"[
        event SequencerBatchAppended(uint256 _startingQueueIndex, uint256 _numQueueElements, uint256 _totalElements)
    ]"#
);
