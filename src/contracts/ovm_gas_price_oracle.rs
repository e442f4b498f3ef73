use ethers::prelude::abigen;

// L2 predeploy at 0x420000000000000000000000000000000000000F
abigen!(
    OvmGasPriceOracle,
    r#"[
        function overhead() external view returns (uint256)
        function l1BaseFee() external view returns (uint256)
        function setOverhead(uint256 _overhead) external
        function setL1BaseFee(uint256 _baseFee) external
    ]"#
);
