mod building;
