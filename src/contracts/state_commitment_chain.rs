use ethers::prelude::*;

abigen!(
    StateCommitmentChain,
    r#"[
        event StateBatchAppended(uint256 indexed _batchIndex, bytes32 _batchRoot, uint256 _batchSize, uint256 _prevTotalElements, bytes _extraData)
    ]"#
);
