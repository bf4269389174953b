mod shm_tests;
